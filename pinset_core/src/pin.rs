use crate::cid::{Cid, CidError};
use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Target replica count for a pin.
///
/// `-1` ([`ReplicationFactor::EVERYWHERE`]) asks every peer to hold the
/// content. Non-negative values are stored as-is; placement is not enforced
/// by the pin state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicationFactor(i32);

impl ReplicationFactor {
    pub const EVERYWHERE: Self = Self(-1);

    pub fn new(value: i32) -> Result<Self, PinError> {
        if value < -1 {
            return Err(PinError::ReplicationFactor(value));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i32 {
        self.0
    }

    pub fn is_everywhere(self) -> bool {
        self.0 == -1
    }
}

impl Default for ReplicationFactor {
    fn default() -> Self {
        Self::EVERYWHERE
    }
}

impl fmt::Display for ReplicationFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_everywhere() {
            f.write_str("everywhere")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PinError {
    #[error("invalid cid {cid:?}: {source}")]
    Cid {
        cid: String,
        #[source]
        source: CidError,
    },
    #[error("invalid replication factor {0}: must be -1 or non-negative")]
    ReplicationFactor(i32),
}

/// A cluster-wide commitment to keep the content behind `cid`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Pin {
    pub cid: Cid,
    pub replication_factor: ReplicationFactor,
}

impl Pin {
    pub fn new(cid: Cid, replication_factor: ReplicationFactor) -> Self {
        Self {
            cid,
            replication_factor,
        }
    }

    /// A pin that asks every peer to hold the content.
    pub fn everywhere(cid: Cid) -> Self {
        Self::new(cid, ReplicationFactor::EVERYWHERE)
    }

    pub fn to_serial(&self) -> PinSerial {
        PinSerial {
            cid: self.cid.to_string(),
            replication_factor: self.replication_factor.get(),
        }
    }
}

/// Unvalidated form of a [`Pin`] as carried in the replicated log.
///
/// A peer may submit a string that does not parse; it is still replicated
/// and every replica reaches the same decode failure when applying it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct PinSerial {
    #[n(0)]
    pub cid: String,
    #[n(1)]
    pub replication_factor: i32,
}

impl PinSerial {
    pub fn new(cid: impl Into<String>, replication_factor: i32) -> Self {
        Self {
            cid: cid.into(),
            replication_factor,
        }
    }

    pub fn decode_cid(&self) -> Result<Cid, PinError> {
        Cid::parse(&self.cid).map_err(|source| PinError::Cid {
            cid: self.cid.clone(),
            source,
        })
    }

    pub fn decode(&self) -> Result<Pin, PinError> {
        let cid = self.decode_cid()?;
        let replication_factor = ReplicationFactor::new(self.replication_factor)?;
        Ok(Pin::new(cid, replication_factor))
    }
}

impl From<&Pin> for PinSerial {
    fn from(pin: &Pin) -> Self {
        pin.to_serial()
    }
}
