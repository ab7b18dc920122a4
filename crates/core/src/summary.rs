//! Opaque, versioned envelope carrying an aggregator's partial state.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DpAggError, Result};

const SUMMARY_VERSION: u8 = 1;

/// Serialized partial state of one aggregator.
///
/// The payload layout is private to the aggregator that produced it; the only
/// public contract is that a summary can be merged into an aggregator of the
/// identical shape. The first byte is a format version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Summary {
    data: Vec<u8>,
}

impl Summary {
    /// Encode a payload into an envelope.
    pub fn encode<P: Serialize>(payload: &P) -> Summary {
        let mut data = vec![SUMMARY_VERSION];
        // Plain struct/vec payloads cannot fail to encode; a failure would
        // surface as an empty payload and be rejected at decode time.
        data.extend(bincode::serialize(payload).unwrap_or_default());
        Summary { data }
    }

    /// Decode the payload, verifying the version tag.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P> {
        let Some((&version, payload)) = self.data.split_first() else {
            return Err(DpAggError::internal("Cannot merge summary with no data."));
        };
        if version != SUMMARY_VERSION {
            return Err(DpAggError::internal(format!(
                "Summary has unsupported version {version}."
            )));
        }
        bincode::deserialize(payload)
            .map_err(|err| DpAggError::internal(format!("Summary unable to be unpacked: {err}.")))
    }

    /// The raw envelope bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Rebuild an envelope from raw bytes (e.g. after external transport).
    pub fn from_bytes(data: Vec<u8>) -> Summary {
        Summary { data }
    }
}
