// Copyright (c) 2026 Adrian Robinson. All rights reserved.
// Licensed under the MIT License. See LICENSE file in the project root for full license information.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::state::GCounterState;
use crate::traits::CounterError;

/// Envelope type for a counter state broadcast.
pub const GCOUNTER_MESSAGE: &str = "g-counter.network.message";
/// Envelope type for the first half of the peer-discovery handshake.
pub const PEER_OHAI_MESSAGE: &str = "peer.ohai.network.message";
/// Envelope type for the reply half of the peer-discovery handshake.
pub const PEER_HELLO_MESSAGE: &str = "peer.hello.network.message";

/// Metadata key carrying the sender's reachable IP.
pub const METADATA_IP: &str = "my_ip";
/// Metadata key carrying the sender's listening TCP port.
pub const METADATA_TCP_PORT: &str = "my_tcp_port";

/// The on-wire message: a type tag, the sender's replica identity, an
/// embedded counter state (empty for handshake messages) and free-form
/// discovery metadata.
///
/// Deliberately a plain struct with a string tag rather than a tagged enum:
/// receivers must tolerate unknown types and absent fields by defaulting,
/// not by failing the parse. The envelope carries a CRDT value; it is not
/// the persisted canonical form, which is the bare [`GCounterState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub source_peer: String,
    #[serde(flatten)]
    pub state: GCounterState,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NetworkMessage {
    /// A counter state broadcast, carrying discovery metadata so receivers
    /// can dial back.
    pub fn g_counter(
        source_peer: impl Into<String>,
        state: GCounterState,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            message_type: GCOUNTER_MESSAGE.to_string(),
            source_peer: source_peer.into(),
            state,
            metadata,
        }
    }

    /// The discovery greeting, carrying only the sender's address metadata.
    pub fn peer_ohai(source_peer: impl Into<String>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            message_type: PEER_OHAI_MESSAGE.to_string(),
            source_peer: source_peer.into(),
            state: GCounterState::new(),
            metadata,
        }
    }

    /// The discovery reply.
    pub fn peer_hello(source_peer: impl Into<String>) -> Self {
        Self {
            message_type: PEER_HELLO_MESSAGE.to_string(),
            source_peer: source_peer.into(),
            state: GCounterState::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Serializes the envelope to one JSON frame.
    ///
    /// Failure to serialize our own message is a setup bug and aborts.
    pub fn to_bytes(&self) -> Vec<u8> {
        match serde_json::to_vec(self) {
            Ok(bytes) => bytes,
            Err(e) => panic!("cannot serialize network message: {e}"),
        }
    }

    /// Parses one JSON frame. Errors are meant to be logged and dropped.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CounterError> {
        serde_json::from_slice(bytes).map_err(|e| CounterError::Envelope(e.to_string()))
    }
}
