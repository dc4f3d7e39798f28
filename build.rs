fn main() -> Result<(), anyhow::Error> {
    println!("cargo:rerun-if-changed=proto/workload.proto");

    let mut proto_config = prost_build::Config::new();
    proto_config.bytes(["."]);

    let file_descriptors = protox::compile(["workload.proto"], ["proto"])?;

    // The server half backs the in-process fake Workload API used by tests.
    tonic_prost_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_fds_with_config(file_descriptors, proto_config)?;

    Ok(())
}
