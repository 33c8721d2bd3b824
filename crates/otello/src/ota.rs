use alloc::borrow::Cow;
use alloc::string::String;
use alloc::vec::Vec;

use core::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use serde::Serialize;

/// Name of the report event through which an end node acknowledges
/// adaptation operations.
pub const REPORT_EVENT: &str = "report";

/// The checksum algorithm used by the transfer payload.
pub const CHECKSUM_ALGO: &str = "crc32";

/// All possible transfer payload defects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadError {
    /// The payload declares a checksum algorithm other than
    /// [`CHECKSUM_ALGO`].
    UnknownAlgorithm,
    /// The payload data is not valid base64.
    Decode,
    /// The decoded content does not match the declared checksum.
    ChecksumMismatch,
}

impl PayloadError {
    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::UnknownAlgorithm => "payload declares an unknown checksum algorithm",
            Self::Decode => "payload data is not valid base64",
            Self::ChecksumMismatch => "payload content does not match its checksum",
        }
    }
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.description().fmt(f)
    }
}

impl core::error::Error for PayloadError {}

/// The integrity-checked content of a file transfer.
///
/// The raw bytes travel base64 encoded next to their `crc32` checksum, so a
/// receiving end node can verify the content before touching its
/// filesystem.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct WritePayload {
    /// Base64 encoded file content.
    pub data: String,
    /// Checksum of the raw content.
    pub hash: u32,
    /// Checksum algorithm name.
    pub algo: Cow<'static, str>,
}

impl WritePayload {
    /// Creates a [`WritePayload`] from raw file content.
    #[must_use]
    pub fn from_bytes(content: &[u8]) -> Self {
        Self {
            data: STANDARD.encode(content),
            hash: crc32fast::hash(content),
            algo: Cow::Borrowed(CHECKSUM_ALGO),
        }
    }

    /// Decodes the payload back into raw file content, verifying its
    /// checksum.
    ///
    /// # Errors
    ///
    /// A [`PayloadError`] is returned when the algorithm is unknown, the
    /// data is not valid base64, or the checksum does not match.
    pub fn decode(&self) -> Result<Vec<u8>, PayloadError> {
        if self.algo != CHECKSUM_ALGO {
            return Err(PayloadError::UnknownAlgorithm);
        }

        let content = STANDARD
            .decode(&self.data)
            .map_err(|_| PayloadError::Decode)?;

        if crc32fast::hash(&content) != self.hash {
            return Err(PayloadError::ChecksumMismatch);
        }

        Ok(content)
    }
}

/// The body of an `OTAInit` action.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct OtaInit {
    /// URL of the capability model describing the adapted application.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// The body of an `OTAWrite` action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct OtaWrite {
    /// Destination path on the end node.
    pub path: String,
    /// Transferred content.
    pub payload: WritePayload,
    /// Whether the content extends an existing file instead of replacing
    /// it.
    pub append: bool,
}

/// The body of an `OTADelete` action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct OtaDelete {
    /// Path to remove on the end node.
    pub path: String,
    /// Whether a directory is removed together with its content.
    pub recursive: bool,
}

/// The body of an `OTAFinish` action.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct OtaFinish {}

/// The body of an `OTARollback` action.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct OtaRollback {}

/// An adaptation action invokable on an end node.
///
/// The action name selects the invocation topic; only the body travels as
/// the message payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OtaAction {
    /// Open an adaptation on the end node.
    Init(OtaInit),
    /// Write one file.
    Write(OtaWrite),
    /// Delete one path.
    Delete(OtaDelete),
    /// Commit the adaptation and restart into the new application.
    Finish(OtaFinish),
    /// Discard every change of the open adaptation.
    Rollback(OtaRollback),
}

impl OtaAction {
    /// Creates an `OTAInit` action.
    #[must_use]
    pub const fn init(model: Option<String>) -> Self {
        Self::Init(OtaInit { model })
    }

    /// Creates an `OTAWrite` action carrying the given file content.
    #[must_use]
    pub fn write(path: impl Into<String>, content: &[u8], append: bool) -> Self {
        Self::Write(OtaWrite {
            path: path.into(),
            payload: WritePayload::from_bytes(content),
            append,
        })
    }

    /// Creates an `OTADelete` action.
    #[must_use]
    pub fn delete(path: impl Into<String>, recursive: bool) -> Self {
        Self::Delete(OtaDelete {
            path: path.into(),
            recursive,
        })
    }

    /// Creates an `OTAFinish` action.
    #[must_use]
    pub const fn finish() -> Self {
        Self::Finish(OtaFinish {})
    }

    /// Creates an `OTARollback` action.
    #[must_use]
    pub const fn rollback() -> Self {
        Self::Rollback(OtaRollback {})
    }

    /// Returns the name of the action affordance this body belongs to.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "OTAInit",
            Self::Write(_) => "OTAWrite",
            Self::Delete(_) => "OTADelete",
            Self::Finish(_) => "OTAFinish",
            Self::Rollback(_) => "OTARollback",
        }
    }

    /// Serializes the action body for publication.
    ///
    /// # Errors
    ///
    /// An error is returned when the body cannot be serialized.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// The instant at which an end node produced a report.
///
/// Constrained nodes often lack a real-time clock; they count seconds from
/// the year their clock starts at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct ReportTimestamp {
    /// The year the node clock counts from.
    pub epoch_year: u16,
    /// Seconds elapsed since that epoch.
    pub seconds: u64,
}

impl ReportTimestamp {
    /// Creates a [`ReportTimestamp`].
    #[must_use]
    pub const fn new(epoch_year: u16, seconds: u64) -> Self {
        Self {
            epoch_year,
            seconds,
        }
    }
}

/// The outcome carried by a report event.
///
/// A report carries exactly one outcome; decoding rejects any other shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReportResult {
    /// One file write completed.
    Written {
        /// The written path.
        written: String,
    },
    /// One deletion completed.
    Deleted {
        /// The removed paths.
        deleted: Vec<String>,
    },
    /// The operation failed on the end node.
    Failed {
        /// Failure marker.
        error: bool,
        /// Failure description produced by the node.
        message: String,
    },
}

impl ReportResult {
    /// Creates a [`ReportResult`] for a completed write.
    #[must_use]
    pub fn written(path: impl Into<String>) -> Self {
        Self::Written {
            written: path.into(),
        }
    }

    /// Creates a [`ReportResult`] for a completed deletion.
    #[must_use]
    pub fn deleted(paths: Vec<String>) -> Self {
        Self::Deleted { deleted: paths }
    }

    /// Creates a [`ReportResult`] for a failed operation.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            error: true,
            message: message.into(),
        }
    }
}

#[cfg(feature = "deserialize")]
impl<'de> serde::Deserialize<'de> for ReportResult {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        struct RawResult {
            written: Option<String>,
            deleted: Option<Vec<String>>,
            error: Option<bool>,
            message: Option<String>,
        }

        let raw = RawResult::deserialize(deserializer)?;

        let outcomes =
            usize::from(raw.written.is_some()) + usize::from(raw.deleted.is_some())
                + usize::from(raw.error.is_some());
        if outcomes != 1 {
            return Err(serde::de::Error::custom(
                "report result must carry exactly one of `written`, `deleted`, or `error`",
            ));
        }

        if let Some(written) = raw.written {
            Ok(Self::Written { written })
        } else if let Some(deleted) = raw.deleted {
            Ok(Self::Deleted { deleted })
        } else {
            Ok(Self::Failed {
                error: raw.error.unwrap_or(true),
                message: raw.message.unwrap_or_default(),
            })
        }
    }
}

/// A report event published by an end node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct DeviceReport {
    /// When the node produced the report.
    pub timestamp: ReportTimestamp,
    /// The reported outcome.
    pub result: ReportResult,
}

impl DeviceReport {
    /// Creates a [`DeviceReport`].
    #[must_use]
    pub const fn new(timestamp: ReportTimestamp, result: ReportResult) -> Self {
        Self { timestamp, result }
    }
}
