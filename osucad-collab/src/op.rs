//! Mutations and sequenced operations.
//!
//! ```text
//! Mutation          { target, payload, client_id, local_sequence }
//!   + ref seq  ──►  OutboundMutation     (client → server)
//!   + seq      ──►  Operation            (server → every client)
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::object::{MutationPayload, ObjectId};

/// Session identity of a connected client.
pub type ClientId = Uuid;

/// Document identity.
pub type DocumentId = Uuid;

/// An intended change to one shared object, before sequencing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub target: ObjectId,
    pub payload: MutationPayload,
    pub client_id: ClientId,
    /// Per-client counter, used to match round-tripped operations.
    pub local_sequence: u64,
}

impl Mutation {
    pub fn normalized(self) -> Self {
        Self {
            payload: self.payload.normalized(),
            ..self
        }
    }
}

/// A mutation as submitted to the server, stamped with the last sequence
/// number the client had seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMutation {
    pub mutation: Mutation,
    pub reference_sequence_number: u64,
}

/// A sequenced mutation. Sequence numbers strictly increase per document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub sequence_number: u64,
    pub reference_sequence_number: u64,
    pub mutation: Mutation,
}

impl Operation {
    pub fn sequenced(outbound: OutboundMutation, sequence_number: u64) -> Self {
        Self {
            sequence_number,
            reference_sequence_number: outbound.reference_sequence_number,
            mutation: outbound.mutation,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.mutation.client_id
    }

    pub fn target(&self) -> &ObjectId {
        &self.mutation.target
    }
}
