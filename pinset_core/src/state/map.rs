use super::{PinState, SNAPSHOT_VERSION, StateError};
use crate::cid::Cid;
use crate::pin::{Pin, ReplicationFactor};
use minicbor::{Decode, Decoder, Encode, Encoder};
use std::collections::BTreeMap;

/// In-memory pin state ordered by cid.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MapState {
    pins: BTreeMap<Cid, Pin>,
}

#[derive(Debug, Encode, Decode)]
#[cbor(array)]
struct PinRecord {
    #[cbor(n(0), with = "minicbor::bytes")]
    cid: Vec<u8>,
    #[n(1)]
    replication_factor: i32,
}

impl MapState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PinState for MapState {
    fn add(&mut self, pin: Pin) {
        self.pins.insert(pin.cid.clone(), pin);
    }

    fn remove(&mut self, cid: &Cid) {
        self.pins.remove(cid);
    }

    fn list(&self) -> Vec<Pin> {
        self.pins.values().cloned().collect()
    }

    fn has(&self, cid: &Cid) -> bool {
        self.pins.contains_key(cid)
    }

    fn get(&self, cid: &Cid) -> Option<Pin> {
        self.pins.get(cid).cloned()
    }

    fn len(&self) -> usize {
        self.pins.len()
    }

    fn export(&self) -> Result<Vec<u8>, StateError> {
        let records: Vec<PinRecord> = self
            .pins
            .values()
            .map(|pin| PinRecord {
                cid: pin.cid.to_bytes(),
                replication_factor: pin.replication_factor.get(),
            })
            .collect();

        let mut e = Encoder::new(Vec::new());
        e.array(2)
            .and_then(|e| e.u8(SNAPSHOT_VERSION))
            .and_then(|e| e.encode(&records))
            .map_err(|err| StateError::Encode(err.to_string()))?;
        Ok(e.into_writer())
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), StateError> {
        let decode_err = |err: minicbor::decode::Error| StateError::Decode(err.to_string());

        let mut d = Decoder::new(bytes);
        if d.array().map_err(decode_err)? != Some(2) {
            return Err(StateError::Decode(
                "expected a two element snapshot header".to_string(),
            ));
        }
        let version = d.u8().map_err(decode_err)?;
        if version != SNAPSHOT_VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }
        let records: Vec<PinRecord> = d.decode().map_err(decode_err)?;

        let mut pins = BTreeMap::new();
        for record in records {
            let cid = Cid::from_bytes(&record.cid)?;
            let replication_factor = ReplicationFactor::new(record.replication_factor)
                .map_err(|_| StateError::InvalidReplicationFactor(record.replication_factor))?;
            pins.insert(cid.clone(), Pin::new(cid, replication_factor));
        }
        self.pins = pins;
        Ok(())
    }
}
