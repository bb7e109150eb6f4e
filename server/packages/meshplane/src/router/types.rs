use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddAdapterRequest {
    #[serde(rename = "meshLocationURL", default)]
    pub mesh_location_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterQuery {
    #[serde(default)]
    pub adapter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub adapter: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOperationBody {
    #[serde(default)]
    pub adapter: String,
    /// Operation key as advertised by the adapter.
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub custom_body: String,
    #[serde(default)]
    pub delete_op: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOperationResponse {
    pub operation_id: String,
}
