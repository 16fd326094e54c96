//! ABI codec seams.
//!
//! The runtime never looks inside call payloads or logs itself. Calls go
//! through a [`CallCodec`] (method name + positional arguments to calldata,
//! return data back to values) and logs through an [`EventKind`] that knows
//! its topic and how to turn a raw log into a typed record.
//!
//! Two implementations ship with the crate:
//!
//! - [`JsonAbiCodec`] resolves methods against a JSON ABI at runtime
//! - [`SolEventKind`] decodes logs into a `sol!`-generated event struct

use std::{fmt, marker::PhantomData, sync::Arc};

use alloy::{
    dyn_abi::{DecodedEvent, DynSolValue, EventExt, FunctionExt, JsonAbiExt},
    json_abi::{Event, Function, JsonAbi},
    primitives::{Bytes, B256},
    rpc::types::Log,
    sol_types::SolEvent,
};

use crate::{
    contract_error::decode_with_abi,
    ext::{CodecError, DecodedError, ErrorCatalogue},
};

// ============================================================================
// Calls
// ============================================================================

/// Encodes method calls and decodes their results and custom errors.
pub trait CallCodec: Send + Sync {
    /// Calldata (selector included) for `method(args...)`.
    fn encode_call(&self, method: &str, args: &[DynSolValue]) -> Result<Bytes, CodecError>;

    /// Decode the return data of `method` called with `arity` arguments.
    fn decode_output(
        &self,
        method: &str,
        arity: usize,
        data: &[u8],
    ) -> Result<Vec<DynSolValue>, CodecError>;

    /// Match revert data against the custom errors this codec knows about.
    fn decode_error(&self, data: &[u8]) -> Option<DecodedError>;
}

/// [`CallCodec`] backed by a JSON ABI.
///
/// Overloaded methods are told apart by argument count.
#[derive(Debug, Clone)]
pub struct JsonAbiCodec {
    contract: String,
    abi: Arc<JsonAbi>,
}

impl JsonAbiCodec {
    pub fn new(contract: impl Into<String>, abi: JsonAbi) -> Self {
        Self {
            contract: contract.into(),
            abi: Arc::new(abi),
        }
    }

    /// Parse a JSON ABI document (the `abi` array of a compiler artifact).
    pub fn from_json(contract: impl Into<String>, json: &str) -> Result<Self, CodecError> {
        let abi: JsonAbi = serde_json::from_str(json).map_err(|e| CodecError::Decode {
            what: "json abi".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(contract, abi))
    }

    /// Build from human-readable signatures such as
    /// `"function transfer(address to, uint256 amount) returns (bool)"`.
    pub fn parse<'a>(
        contract: impl Into<String>,
        signatures: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, CodecError> {
        let abi = JsonAbi::parse(signatures).map_err(|e| CodecError::Decode {
            what: "abi signatures".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(contract, abi))
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    pub fn abi(&self) -> &Arc<JsonAbi> {
        &self.abi
    }

    /// Look up an event declared in the ABI.
    pub fn event(&self, name: &str) -> Result<AbiEventKind, CodecError> {
        let event = self
            .abi
            .event(name)
            .and_then(|overloads| overloads.first())
            .ok_or_else(|| CodecError::EventMismatch(name.to_string()))?;
        Ok(AbiEventKind::new(event.clone()))
    }

    fn function(&self, method: &str, arity: usize) -> Result<&Function, CodecError> {
        let overloads = self
            .abi
            .function(method)
            .ok_or_else(|| CodecError::UnknownMethod(method.to_string()))?;
        overloads
            .iter()
            .find(|f| f.inputs.len() == arity)
            .ok_or_else(|| CodecError::ArityMismatch {
                method: method.to_string(),
                arity,
            })
    }
}

impl CallCodec for JsonAbiCodec {
    fn encode_call(&self, method: &str, args: &[DynSolValue]) -> Result<Bytes, CodecError> {
        let function = self.function(method, args.len())?;
        function
            .abi_encode_input(args)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode {
                method: method.to_string(),
                reason: e.to_string(),
            })
    }

    fn decode_output(
        &self,
        method: &str,
        arity: usize,
        data: &[u8],
    ) -> Result<Vec<DynSolValue>, CodecError> {
        let function = self.function(method, arity)?;
        function
            .abi_decode_output(data)
            .map_err(|e| CodecError::Decode {
                what: format!("output of `{method}`"),
                reason: e.to_string(),
            })
    }

    fn decode_error(&self, data: &[u8]) -> Option<DecodedError> {
        decode_with_abi(&self.contract, &self.abi, data)
    }
}

/// A codec doubles as an error catalogue for the resolver.
impl ErrorCatalogue for JsonAbiCodec {
    fn contract(&self) -> &str {
        &self.contract
    }

    fn decode(&self, data: &[u8]) -> Option<DecodedError> {
        self.decode_error(data)
    }
}

// ============================================================================
// Events
// ============================================================================

/// One kind of contract event: its topic and how to decode it.
pub trait EventKind: Send + Sync + 'static {
    /// Typed record a matching log decodes into.
    type Record: Send + 'static;

    /// Name used in logs and observer callbacks.
    fn name(&self) -> &str;

    /// Event signature hash, matched against the log's first topic.
    fn topic0(&self) -> B256;

    fn decode(&self, log: &Log) -> Result<Self::Record, CodecError>;
}

/// Event kind for a `sol!`-generated event type.
pub struct SolEventKind<E>(PhantomData<fn() -> E>);

impl<E> SolEventKind<E> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for SolEventKind<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for SolEventKind<E> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E: SolEvent> fmt::Debug for SolEventKind<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SolEventKind").field(&E::SIGNATURE).finish()
    }
}

impl<E> EventKind for SolEventKind<E>
where
    E: SolEvent + Send + 'static,
{
    type Record = E;

    fn name(&self) -> &str {
        E::SIGNATURE
    }

    fn topic0(&self) -> B256 {
        E::SIGNATURE_HASH
    }

    fn decode(&self, log: &Log) -> Result<E, CodecError> {
        if log.topic0() != Some(&E::SIGNATURE_HASH) {
            return Err(CodecError::EventMismatch(E::SIGNATURE.to_string()));
        }
        E::decode_log_data(log.data()).map_err(|e| CodecError::Decode {
            what: E::SIGNATURE.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Event kind resolved from a JSON ABI; records are dynamically typed.
#[derive(Debug, Clone)]
pub struct AbiEventKind {
    event: Event,
    signature: String,
}

impl AbiEventKind {
    pub fn new(event: Event) -> Self {
        let signature = event.signature();
        Self { event, signature }
    }
}

impl EventKind for AbiEventKind {
    type Record = DecodedEvent;

    fn name(&self) -> &str {
        &self.signature
    }

    fn topic0(&self) -> B256 {
        self.event.selector()
    }

    fn decode(&self, log: &Log) -> Result<DecodedEvent, CodecError> {
        self.event
            .decode_log(log.data())
            .map_err(|e| CodecError::Decode {
                what: self.signature.clone(),
                reason: e.to_string(),
            })
    }
}
