//! Profile, app, and device records

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::SecretHash;

/// A record kept as one document per id plus one membership marker per id.
///
/// Markers are separate paths so concurrent adds from different writers
/// never overwrite each other.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Path segment, e.g. `apps`
    const NAMESPACE: &'static str;

    /// Assigned id, if any
    fn id(&self) -> Option<&str>;

    /// Assign the id (only the registry does this)
    fn set_id(&mut self, id: String);

    /// Prefix shared by every membership marker, e.g. `/apps/index/`
    fn index_prefix() -> String {
        format!("/{}/index/", Self::NAMESPACE)
    }

    /// Membership marker of one item, e.g. `/apps/index/01H...`
    fn index_path(id: &str) -> String {
        format!("{}{}", Self::index_prefix(), id)
    }

    /// Path of one item, e.g. `/apps/01H...`
    fn item_path(id: &str) -> String {
        format!("/{}/{}", Self::NAMESPACE, id)
    }
}

/// Full profile document, stored at `/` of the profile's store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// ULID, assigned on creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Login name
    pub username: String,
    /// Given name
    #[serde(default)]
    pub firstname: String,
    /// Family name
    #[serde(default)]
    pub lastname: String,
    /// Avatar (URL or data URI)
    #[serde(default)]
    pub image: String,
    /// Passphrase verifier; never the passphrase itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_hash: Option<SecretHash>,
}

/// Profile without its passphrase verifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    /// ULID
    pub id: String,
    /// Login name
    pub username: String,
    /// Given name
    pub firstname: String,
    /// Family name
    pub lastname: String,
    /// Avatar
    pub image: String,
}

impl Profile {
    /// Strip the verifier; `None` if the profile has no id yet.
    pub fn to_public(&self) -> Option<PublicProfile> {
        Some(PublicProfile {
            id: self.id.clone()?,
            username: self.username.clone(),
            firstname: self.firstname.clone(),
            lastname: self.lastname.clone(),
            image: self.image.clone(),
        })
    }
}

/// Input for profile creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProfile {
    /// Login name
    pub username: String,
    /// Given name (optional)
    #[serde(default)]
    pub firstname: String,
    /// Family name (optional)
    #[serde(default)]
    pub lastname: String,
    /// Avatar
    #[serde(default)]
    pub image: String,
    /// Plaintext passphrase; hashed before anything is stored
    pub passphrase: String,
}

/// A third-party application registered to a profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    /// ULID, assigned on creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Display name; also identifies the app within a profile
    pub name: String,
    /// Free text
    #[serde(default)]
    pub description: String,
    /// Icon URL
    #[serde(default)]
    pub image: String,
    /// Hex public key of the app's own store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_key: Option<String>,
}

impl Resource for App {
    const NAMESPACE: &'static str = "apps";

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }
}

/// One of the user's devices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// ULID, assigned on creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Display name
    pub name: String,
    /// Free text
    #[serde(default)]
    pub description: String,
    /// Icon URL
    #[serde(default)]
    pub image: String,
}

impl Resource for Device {
    const NAMESPACE: &'static str = "devices";

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }
}

/// What a third-party app presents when asking for access
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRequest {
    /// Display name
    pub name: String,
    /// Free text
    #[serde(default)]
    pub description: String,
    /// Icon URL
    #[serde(default)]
    pub image: String,
}

impl AppRequest {
    /// Record for this request, bound to the app's store
    pub fn to_app(&self, store_key: impl Into<String>) -> App {
        App {
            id: None,
            name: self.name.clone(),
            description: self.description.clone(),
            image: self.image.clone(),
            store_key: Some(store_key.into()),
        }
    }
}

/// Name of the store holding an app's private data
pub fn app_store_name(profile_id: &str, app_name: &str) -> String {
    format!("{}-{}", profile_id, app_name)
}
