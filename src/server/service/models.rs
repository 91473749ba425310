use serde::{Deserialize, Deserializer, Serialize};

/// Body of `PUT /api/v1/service/{service_id}`, JSON or form encoded
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct UpdateServiceRequest {
    /// New image reference, empty or absent keeps the current one
    #[serde(default)]
    pub image: Option<String>,
    /// Attach registry credentials for the image's registry
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub auth: bool,
}

impl UpdateServiceRequest {
    /// The image to commit, unchanged. Blank means keep the current one.
    pub fn requested_image(&self) -> Option<&str> {
        self.image.as_deref().filter(|i| !i.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateServiceResponse {
    pub status: String,
    pub image: String,
    pub warnings: Vec<String>,
}

impl UpdateServiceResponse {
    pub fn success(image: impl Into<String>, warnings: Vec<String>) -> Self {
        Self {
            status: "success".to_string(),
            image: image.into(),
            warnings,
        }
    }
}

/// Form fields arrive as strings (`auth=on`, `auth=1`), JSON as a real boolean
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Option::<Flag>::deserialize(deserializer)? {
        None => Ok(false),
        Some(Flag::Bool(b)) => Ok(b),
        Some(Flag::Text(s)) => match s.as_str() {
            "1" | "t" | "T" | "true" | "TRUE" | "True" | "on" => Ok(true),
            "" | "0" | "f" | "F" | "false" | "FALSE" | "False" | "off" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "invalid boolean value {:?} for field auth",
                other
            ))),
        },
    }
}
