//! Custom error resolution.
//!
//! A failed broadcast or call usually carries the contract's revert data in
//! the JSON-RPC error payload. The [`ErrorResolver`] extracts that data and
//! tries every known error catalogue against its 4-byte selector; a match
//! becomes a [`DecodedError`] with the error name and decoded parameters,
//! anything else is handed back untouched.
//!
//! ## Catalogues
//!
//! Catalogues come from two places:
//!
//! 1. Injected when the resolver is built (`ErrorResolver::new().with_catalogue(..)`)
//! 2. Registered at link time with `register_contract_errors!`, collected by the
//!    `inventory` crate and included by `ErrorResolver::with_registered()`
//!
//! ```text
//! register_contract_errors!(Bridge => ["error Paused()", ...])
//!     │
//!     ▼
//! inventory::submit!(RegisteredErrors { ... })
//!     │
//!     ▼ (at link time)
//! inventory::iter::<RegisteredErrors>
//!     │
//!     ▼ (ErrorResolver::with_registered)
//! AbiErrorCatalogue::parse(contract, signatures)
//! ```

use std::{fmt, sync::Arc};

use alloy::{
    dyn_abi::{DynSolValue, JsonAbiExt},
    json_abi::JsonAbi,
    primitives::{Address, Bytes},
    transports::{RpcError, TransportError},
};

use crate::ext::{CallRequest, CodecError};

// ============================================================================
// DecodedError
// ============================================================================

/// A contract custom error decoded from revert data.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedError {
    /// Contract whose catalogue matched
    pub contract: String,
    /// Error name, e.g. `InsufficientBalance`
    pub name: String,
    /// Decoded parameters in declaration order
    pub params: Vec<DynSolValue>,
    /// Raw revert data (selector included)
    pub data: Bytes,
}

impl fmt::Display for DecodedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}(", self.contract, self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param:?}")?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for DecodedError {}

// ============================================================================
// Catalogues
// ============================================================================

/// A set of custom errors that revert data can be matched against.
pub trait ErrorCatalogue: Send + Sync {
    /// Name of the contract the errors belong to.
    fn contract(&self) -> &str;

    /// Decode `data` (selector included) or return `None` if no error matches.
    fn decode(&self, data: &[u8]) -> Option<DecodedError>;
}

/// Error catalogue backed by a JSON ABI.
#[derive(Debug, Clone)]
pub struct AbiErrorCatalogue {
    contract: String,
    abi: Arc<JsonAbi>,
}

impl AbiErrorCatalogue {
    pub fn new(contract: impl Into<String>, abi: Arc<JsonAbi>) -> Self {
        Self {
            contract: contract.into(),
            abi,
        }
    }

    /// Build a catalogue from human-readable signatures such as
    /// `"error InsufficientBalance(uint256 available, uint256 required)"`.
    pub fn parse<'a>(
        contract: impl Into<String>,
        signatures: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, CodecError> {
        let abi = JsonAbi::parse(signatures).map_err(|e| CodecError::Decode {
            what: "error signatures".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(contract, Arc::new(abi)))
    }
}

impl ErrorCatalogue for AbiErrorCatalogue {
    fn contract(&self) -> &str {
        &self.contract
    }

    fn decode(&self, data: &[u8]) -> Option<DecodedError> {
        decode_with_abi(&self.contract, &self.abi, data)
    }
}

/// Match `data` against every custom error declared in `abi`.
pub(crate) fn decode_with_abi(contract: &str, abi: &JsonAbi, data: &[u8]) -> Option<DecodedError> {
    if data.len() < 4 {
        return None;
    }
    let (selector, body) = data.split_at(4);

    abi.errors()
        .filter(|error| error.selector().as_slice() == selector)
        .find_map(|error| {
            error.abi_decode_input(body).ok().map(|params| DecodedError {
                contract: contract.to_string(),
                name: error.name.clone(),
                params,
                data: Bytes::copy_from_slice(data),
            })
        })
}

// ============================================================================
// Link-time registry
// ============================================================================

/// Error signatures registered by `register_contract_errors!`.
pub struct RegisteredErrors {
    pub contract: &'static str,
    pub signatures: &'static [&'static str],
}

inventory::collect!(RegisteredErrors);

/// Register a contract's custom error signatures with the link-time registry.
///
/// # Example
///
/// ```ignore
/// alloy_relay::register_contract_errors!(
///     Bridge => [
///         "error Paused()",
///         "error NonceAlreadyProcessed(uint256 nonce)",
///     ],
/// );
/// ```
#[macro_export]
macro_rules! register_contract_errors {
    ($($contract:ident => [$($signature:literal),* $(,)?]),* $(,)?) => {
        $(
            $crate::__private::inventory::submit! {
                $crate::ext::RegisteredErrors {
                    contract: stringify!($contract),
                    signatures: &[$($signature),*],
                }
            }
        )*
    };
}

// ============================================================================
// ErrorResolver
// ============================================================================

/// Outcome of resolving a raw failure.
#[derive(Debug)]
pub enum ResolvedError {
    /// A catalogue recognised the revert data
    Decoded(DecodedError),
    /// Nothing matched; the original error is returned unchanged
    Raw(TransportError),
}

/// Translates raw RPC failures into decoded custom errors.
///
/// Resolution is a pure translation step: it performs no I/O and never
/// retries anything.
#[derive(Clone, Default)]
pub struct ErrorResolver {
    catalogues: Vec<Arc<dyn ErrorCatalogue>>,
}

impl fmt::Debug for ErrorResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let contracts: Vec<&str> = self.catalogues.iter().map(|c| c.contract()).collect();
        f.debug_struct("ErrorResolver")
            .field("catalogues", &contracts)
            .finish()
    }
}

impl ErrorResolver {
    /// Resolver with no catalogues; every error resolves to `Raw`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver preloaded with every catalogue registered through
    /// `register_contract_errors!`. Registrations whose signatures fail to
    /// parse are skipped with a warning.
    pub fn with_registered() -> Self {
        let mut resolver = Self::new();
        for entry in inventory::iter::<RegisteredErrors> {
            match AbiErrorCatalogue::parse(entry.contract, entry.signatures.iter().copied()) {
                Ok(catalogue) => resolver.catalogues.push(Arc::new(catalogue)),
                Err(e) => {
                    tracing::warn!(contract = entry.contract, error = %e, "skipping registered error catalogue")
                }
            }
        }
        resolver
    }

    /// Add a catalogue. Catalogues are tried in insertion order.
    pub fn with_catalogue(mut self, catalogue: impl ErrorCatalogue + 'static) -> Self {
        self.catalogues.push(Arc::new(catalogue));
        self
    }

    pub fn push_catalogue(&mut self, catalogue: Arc<dyn ErrorCatalogue>) {
        self.catalogues.push(catalogue);
    }

    pub fn catalogue_count(&self) -> usize {
        self.catalogues.len()
    }

    /// Decode raw revert data against the catalogues.
    pub fn decode_revert(&self, data: &[u8]) -> Option<DecodedError> {
        self.catalogues
            .iter()
            .find_map(|catalogue| catalogue.decode(data))
    }

    /// Resolve a raw failure produced while submitting or querying `request`
    /// from `from`.
    pub fn resolve(
        &self,
        error: TransportError,
        from: Address,
        request: &CallRequest,
    ) -> ResolvedError {
        let Some(data) = revert_data(&error) else {
            return ResolvedError::Raw(error);
        };

        match self.decode_revert(&data) {
            Some(decoded) => {
                tracing::debug!(
                    %from,
                    to = %request.to,
                    method = %request.method,
                    error = %decoded,
                    "decoded contract error"
                );
                ResolvedError::Decoded(decoded)
            }
            None => ResolvedError::Raw(error),
        }
    }
}

/// Extract the revert data attached to a JSON-RPC error response.
pub fn revert_data(error: &TransportError) -> Option<Bytes> {
    match error {
        RpcError::ErrorResp(payload) => payload
            .data
            .as_ref()
            .and_then(|data| serde_json::from_str::<Bytes>(data.get()).ok()),
        _ => None,
    }
}
