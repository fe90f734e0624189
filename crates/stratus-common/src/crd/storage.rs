//! Object storage: buckets and the access keys that grant use of them

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ConditionType, ReconcileState, SecretRef};

// =============================================================================
// StratusBucket
// =============================================================================

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BucketAcl {
    #[default]
    Private,
    PublicRead,
    AuthenticatedRead,
    PublicReadWrite,
}

impl BucketAcl {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketAcl::Private => "private",
            BucketAcl::PublicRead => "public-read",
            BucketAcl::AuthenticatedRead => "authenticated-read",
            BucketAcl::PublicReadWrite => "public-read-write",
        }
    }
}

/// Specification for a StratusBucket. The object name is the bucket label.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.stratus.dev",
    version = "v1alpha1",
    kind = "StratusBucket",
    namespaced,
    status = "StratusBucketStatus",
    shortname = "sbkt",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Hostname","type":"string","jsonPath":".status.hostname"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StratusBucketSpec {
    pub region: String,

    #[serde(default)]
    pub acl: BucketAcl,

    #[serde(default)]
    pub cors_enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<SecretRef>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum BucketCondition {
    BucketCreated,
    AccessConfigured,
    Ready,
}

impl ConditionType for BucketCondition {
    const READY: Self = BucketCondition::Ready;

    fn as_str(&self) -> &'static str {
        match self {
            BucketCondition::BucketCreated => "BucketCreated",
            BucketCondition::AccessConfigured => "AccessConfigured",
            BucketCondition::Ready => "Ready",
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StratusBucketStatus {
    #[serde(flatten)]
    pub state: ReconcileState<BucketCondition>,

    /// Endpoint of the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,
}

// =============================================================================
// StratusKey
// =============================================================================

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyPermissions {
    #[default]
    ReadOnly,
    ReadWrite,
}

impl KeyPermissions {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyPermissions::ReadOnly => "read_only",
            KeyPermissions::ReadWrite => "read_write",
        }
    }
}

/// Access a key grants on one bucket
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketAccessGrant {
    pub bucket_name: String,
    pub region: String,
    #[serde(default)]
    pub permissions: KeyPermissions,
}

/// Where the generated key material is written
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedSecret {
    /// Secret name; `<key name>-obj-key` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Specification for a StratusKey
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.stratus.dev",
    version = "v1alpha1",
    kind = "StratusKey",
    namespaced,
    status = "StratusKeyStatus",
    shortname = "skey",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Access Key","type":"string","jsonPath":".status.accessKeyId"}"#,
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".status.secretName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StratusKeySpec {
    pub bucket_access: Vec<BucketAccessGrant>,

    /// Bump to rotate the key
    #[serde(default)]
    pub key_generation: i64,

    #[serde(default)]
    pub generated_secret: GeneratedSecret,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<SecretRef>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum KeyCondition {
    /// The issued key matches the requested generation and its Secret exists
    KeyCurrent,
    KeyCreated,
    SecretWritten,
    Ready,
}

impl ConditionType for KeyCondition {
    const READY: Self = KeyCondition::Ready;

    fn as_str(&self) -> &'static str {
        match self {
            KeyCondition::KeyCurrent => "KeyCurrent",
            KeyCondition::KeyCreated => "KeyCreated",
            KeyCondition::SecretWritten => "SecretWritten",
            KeyCondition::Ready => "Ready",
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StratusKeyStatus {
    #[serde(flatten)]
    pub state: ReconcileState<KeyCondition>,

    /// ID of the key in the cloud
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,

    /// Generation the current key was created for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_key_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,
}

impl StratusKey {
    /// Name of the Secret holding the key material
    pub fn secret_name(&self) -> String {
        match &self.spec.generated_secret.name {
            Some(name) => name.clone(),
            None => format!("{}-obj-key", kube::ResourceExt::name_any(self)),
        }
    }

    /// True when the spec asks for a different key than the one issued
    pub fn needs_rotation(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.last_key_generation)
            .is_some_and(|g| g != self.spec.key_generation)
    }

    /// Whether this key grants access to the given bucket
    pub fn grants_access_to(&self, bucket: &str, region: &str) -> bool {
        self.spec
            .bucket_access
            .iter()
            .any(|g| g.bucket_name == bucket && g.region == region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(generation: i64, last: Option<i64>) -> StratusKey {
        let mut k = StratusKey::new(
            "backup",
            StratusKeySpec {
                bucket_access: vec![BucketAccessGrant {
                    bucket_name: "etcd-backups".into(),
                    region: "us-ord".into(),
                    permissions: KeyPermissions::ReadWrite,
                }],
                key_generation: generation,
                generated_secret: GeneratedSecret::default(),
                credentials_ref: None,
            },
        );
        k.status = Some(StratusKeyStatus {
            last_key_generation: last,
            ..Default::default()
        });
        k
    }

    #[test]
    fn secret_name_defaults_from_object_name() {
        assert_eq!(key(0, None).secret_name(), "backup-obj-key");
        let mut named = key(0, None);
        named.spec.generated_secret.name = Some("custom".into());
        assert_eq!(named.secret_name(), "custom");
    }

    #[test]
    fn rotation_only_when_generation_moves() {
        assert!(!key(0, None).needs_rotation());
        assert!(!key(1, Some(1)).needs_rotation());
        assert!(key(2, Some(1)).needs_rotation());
    }

    #[test]
    fn access_grant_matches_bucket_and_region() {
        let k = key(0, None);
        assert!(k.grants_access_to("etcd-backups", "us-ord"));
        assert!(!k.grants_access_to("etcd-backups", "eu-west"));
    }

    #[test]
    fn acl_and_permissions_use_api_spelling() {
        assert_eq!(
            serde_json::to_value(BucketAcl::PublicRead).unwrap(),
            BucketAcl::PublicRead.as_str()
        );
        assert_eq!(
            serde_json::to_value(KeyPermissions::ReadWrite).unwrap(),
            KeyPermissions::ReadWrite.as_str()
        );
    }
}
