//! Signing seam.
//!
//! A [`TxSigner`] turns an [`UnsignedTx`] into a broadcastable envelope. The
//! runtime fixes chain id, nonce, target, calldata and value; the signer owns
//! everything about pricing. `fee_multiplier` is 1.0 for the original
//! broadcast and grows for replacements (see `GasBump`).

use alloy::{
    eips::eip2718::Encodable2718,
    network::{EthereumWallet, TransactionBuilder},
    primitives::{Address, Bytes, B256, U256},
    providers::Provider,
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
};
use async_trait::async_trait;

use crate::ext::{bump_fee, SignerError};

/// Everything needed to sign one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedTx {
    pub chain_id: u64,
    pub nonce: u64,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    /// Explicit gas limit; estimated by the signer when absent
    pub gas_limit: Option<u64>,
    /// Multiplier applied to the signer's fee estimate
    pub fee_multiplier: f64,
}

/// A signed, encoded transaction ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    /// EIP-2718 encoded transaction
    pub raw: Bytes,
    pub tx_hash: B256,
    pub nonce: u64,
    pub gas_limit: u64,
}

#[async_trait]
pub trait TxSigner: Send + Sync {
    /// Account the signer signs for.
    fn address(&self) -> Address;

    async fn sign(&self, tx: UnsignedTx) -> Result<SignedEnvelope, SignerError>;
}

/// Local-key signer that prices transactions with its provider's EIP-1559
/// fee estimate.
#[derive(Debug, Clone)]
pub struct WalletSigner<P> {
    provider: P,
    wallet: EthereumWallet,
    address: Address,
}

impl<P: Provider> WalletSigner<P> {
    pub fn new(provider: P, signer: PrivateKeySigner) -> Self {
        let address = signer.address();
        Self {
            provider,
            wallet: EthereumWallet::new(signer),
            address,
        }
    }

    /// Build from a hex-encoded private key.
    pub fn from_private_key(provider: P, private_key: &str) -> anyhow::Result<Self> {
        let signer: PrivateKeySigner = private_key
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid private key: {e}"))?;
        Ok(Self::new(provider, signer))
    }
}

#[async_trait]
impl<P: Provider + 'static> TxSigner for WalletSigner<P> {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign(&self, tx: UnsignedTx) -> Result<SignedEnvelope, SignerError> {
        let request = TransactionRequest::default()
            .with_from(self.address)
            .with_to(tx.to)
            .with_input(tx.data)
            .with_value(tx.value)
            .with_nonce(tx.nonce)
            .with_chain_id(tx.chain_id);

        let gas_limit = match tx.gas_limit {
            Some(gas_limit) => gas_limit,
            None => self
                .provider
                .estimate_gas(request.clone())
                .await
                .map_err(SignerError::Estimate)?,
        };

        let fees = self
            .provider
            .estimate_eip1559_fees()
            .await
            .map_err(SignerError::Estimate)?;

        let envelope = request
            .with_gas_limit(gas_limit)
            .with_max_fee_per_gas(bump_fee(fees.max_fee_per_gas, tx.fee_multiplier))
            .with_max_priority_fee_per_gas(bump_fee(
                fees.max_priority_fee_per_gas,
                tx.fee_multiplier,
            ))
            .build(&self.wallet)
            .await
            .map_err(|e| SignerError::Build(e.to_string()))?;

        tracing::trace!(
            address = %self.address,
            nonce = tx.nonce,
            gas_limit,
            fee_multiplier = tx.fee_multiplier,
            "signed transaction"
        );

        Ok(SignedEnvelope {
            raw: envelope.encoded_2718().into(),
            tx_hash: *envelope.tx_hash(),
            nonce: tx.nonce,
            gas_limit,
        })
    }
}
