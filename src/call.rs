//! Call requests and transaction options.
//!
//! A [`CallRequest`] names a contract method and its positional arguments.
//! It is immutable once handed to the submitter: the mining monitor replays it
//! verbatim when it broadcasts a replacement.

use alloy::{
    dyn_abi::DynSolValue,
    eips::BlockId,
    primitives::{Address, U256},
};

use crate::ext::{SubmitConfig, SubmitError};

/// Per-call overrides of the base transaction options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOverrides {
    /// Explicit gas limit; carried over to replacements when set
    pub gas_limit: Option<u64>,
    /// Value to attach instead of the base value
    pub value: Option<U256>,
    /// Use this nonce instead of the sequenced one
    pub nonce: Option<u64>,
}

impl TxOverrides {
    pub fn gas_limit(gas_limit: u64) -> Self {
        Self {
            gas_limit: Some(gas_limit),
            ..Default::default()
        }
    }

    pub fn value(value: U256) -> Self {
        Self {
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn nonce(nonce: u64) -> Self {
        Self {
            nonce: Some(nonce),
            ..Default::default()
        }
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }
}

/// Effective options for one submission: base options with the override
/// applied on top.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub gas_limit: Option<u64>,
    pub value: U256,
    pub nonce: Option<u64>,
    /// Whether `gas_limit` came from the caller rather than the base config
    pub explicit_gas_limit: bool,
}

impl TxOptions {
    /// Copy the base options and apply `overrides`.
    pub fn resolve(base: &SubmitConfig, overrides: Option<&TxOverrides>) -> Self {
        let mut options = TxOptions {
            gas_limit: base.gas_limit,
            value: base.value,
            nonce: None,
            explicit_gas_limit: false,
        };
        if let Some(overrides) = overrides {
            if let Some(gas_limit) = overrides.gas_limit {
                options.gas_limit = Some(gas_limit);
                options.explicit_gas_limit = true;
            }
            if let Some(value) = overrides.value {
                options.value = value;
            }
            options.nonce = overrides.nonce;
        }
        options
    }

    /// Gas limit to carry into a replacement: only an explicit one survives,
    /// otherwise the replacement is estimated anew.
    pub fn replacement_gas_limit(&self) -> Option<u64> {
        self.explicit_gas_limit.then_some(self.gas_limit).flatten()
    }
}

/// A contract method invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    /// Contract address
    pub to: Address,
    /// Method name, resolved against the codec's ABI
    pub method: String,
    /// Positional arguments
    pub args: Vec<DynSolValue>,
    overrides: Vec<TxOverrides>,
}

impl CallRequest {
    pub fn new(to: Address, method: impl Into<String>) -> Self {
        Self {
            to,
            method: method.into(),
            args: Vec::new(),
            overrides: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<DynSolValue>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, values: impl IntoIterator<Item = DynSolValue>) -> Self {
        self.args.extend(values);
        self
    }

    /// Attach an override set. Supplying more than one makes `submit` fail
    /// with `SubmitError::ConflictingOverrides`.
    pub fn with_overrides(mut self, overrides: TxOverrides) -> Self {
        self.overrides.push(overrides);
        self
    }

    /// The single override set, if any.
    pub fn overrides(&self) -> Result<Option<&TxOverrides>, SubmitError> {
        match self.overrides.as_slice() {
            [] => Ok(None),
            [single] => Ok(Some(single)),
            many => Err(SubmitError::ConflictingOverrides(many.len())),
        }
    }
}

/// Block to run a read-only call against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockTag {
    #[default]
    Latest,
    Number(u64),
}

impl From<BlockTag> for BlockId {
    fn from(tag: BlockTag) -> Self {
        match tag {
            BlockTag::Latest => BlockId::latest(),
            BlockTag::Number(number) => BlockId::number(number),
        }
    }
}

impl From<Option<u64>> for BlockTag {
    fn from(block: Option<u64>) -> Self {
        block.map_or(BlockTag::Latest, BlockTag::Number)
    }
}
