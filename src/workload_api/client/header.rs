use tonic::metadata::MetadataValue;

/// Metadata every Workload API request must carry.
pub(crate) const SECURITY_HEADER: &str = "workload.spiffe.io";

/// Stamps the security header onto outgoing requests.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MetadataAdder;

impl tonic::service::Interceptor for MetadataAdder {
    fn call(
        &mut self,
        mut request: tonic::Request<()>,
    ) -> Result<tonic::Request<()>, tonic::Status> {
        request
            .metadata_mut()
            .insert(SECURITY_HEADER, MetadataValue::from_static("true"));
        Ok(request)
    }
}
