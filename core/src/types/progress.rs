use serde::{Deserialize, Serialize};

/// The fixed set of operation states a progress event can carry. The wire
/// strings are stable identifiers consumed by renderers and scripts.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum OpState {
    #[serde(rename = "Downloading repository")]
    DownloadingRepo,
    #[serde(rename = "Downloading")]
    Downloading,
    #[serde(rename = "Uploading")]
    Uploading,
    #[serde(rename = "Adding (git)")]
    AddingGit,
    #[serde(rename = "Adding (annex)")]
    AddingAnnex,
    #[serde(rename = "Locking")]
    Locking,
    #[serde(rename = "Unlocking")]
    Unlocking,
    #[serde(rename = "Removing content")]
    RemovingContent,
    #[serde(rename = "Synchronising repository")]
    Synchronising,
    #[serde(rename = "Recording changes")]
    RecordingChanges,
    #[serde(rename = "Initialising local storage")]
    InitialisingStorage,
}

impl OpState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpState::DownloadingRepo => "Downloading repository",
            OpState::Downloading => "Downloading",
            OpState::Uploading => "Uploading",
            OpState::AddingGit => "Adding (git)",
            OpState::AddingAnnex => "Adding (annex)",
            OpState::Locking => "Locking",
            OpState::Unlocking => "Unlocking",
            OpState::RemovingContent => "Removing content",
            OpState::Synchronising => "Synchronising repository",
            OpState::RecordingChanges => "Recording changes",
            OpState::InitialisingStorage => "Initialising local storage",
        }
    }
}

impl std::fmt::Display for OpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One progress event on a verb's stream. `progress` is a percentage string
/// ("42%", "100%" on completion) and `rate` a human-readable transfer rate.
/// On the wire `err` is an empty string when the event is not a failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoFileStatus {
    #[serde(rename = "filename")]
    pub file_name: String,
    pub state: OpState,
    pub progress: String,
    pub rate: String,
    #[serde(with = "empty_err")]
    pub err: Option<String>,
}

impl RepoFileStatus {
    pub fn transfer(
        state: OpState,
        file_name: impl Into<String>,
        progress: impl Into<String>,
        rate: impl Into<String>,
    ) -> Self {
        RepoFileStatus {
            file_name: file_name.into(),
            state,
            progress: progress.into(),
            rate: rate.into(),
            err: None,
        }
    }

    pub fn done(state: OpState, file_name: impl Into<String>) -> Self {
        Self::transfer(state, file_name, "100%", "")
    }

    pub fn failed(state: OpState, file_name: impl Into<String>, err: impl Into<String>) -> Self {
        RepoFileStatus {
            file_name: file_name.into(),
            state,
            progress: String::new(),
            rate: String::new(),
            err: Some(err.into()),
        }
    }

    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }
}

/// What a blob resolved to during a versioned file checkout.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CheckoutKind {
    Git,
    Annex,
    Tree,
}

/// One event on the `checkout-file-copies` stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileCheckoutStatus {
    #[serde(rename = "filename")]
    pub file_name: String,
    #[serde(rename = "type")]
    pub kind: CheckoutKind,
    pub destination: String,
    #[serde(with = "empty_err")]
    pub err: Option<String>,
}

mod empty_err {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(err: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(err.as_deref().unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(if raw.is_empty() { None } else { Some(raw) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_shape() {
        let ev = RepoFileStatus::transfer(OpState::Uploading, "big.nc", "42%", "12.3 MiB/s");
        let json = serde_json::to_string(&ev).unwrap();
        assert_eq!(
            json,
            r#"{"filename":"big.nc","state":"Uploading","progress":"42%","rate":"12.3 MiB/s","err":""}"#
        );
    }

    #[test]
    fn error_round_trips() {
        let ev = RepoFileStatus::failed(
            OpState::RemovingContent,
            "data.bin",
            "failed (unsafe): could not verify remote copy",
        );
        let json = serde_json::to_string(&ev).unwrap();
        let back: RepoFileStatus = serde_json::from_str(&json).unwrap();
        assert!(back.is_err());
        assert_eq!(back.state, OpState::RemovingContent);
    }

    #[test]
    fn empty_err_deserialises_to_none() {
        let raw = r#"{"filename":"a","state":"Downloading","progress":"100%","rate":"","err":""}"#;
        let ev: RepoFileStatus = serde_json::from_str(raw).unwrap();
        assert!(!ev.is_err());
    }

    #[test]
    fn checkout_event_kind_tag() {
        let ev = FileCheckoutStatus {
            file_name: "data/big.nc".into(),
            kind: CheckoutKind::Annex,
            destination: "copies/big.nc.2020-02-02".into(),
            err: None,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"Annex""#));
    }
}
