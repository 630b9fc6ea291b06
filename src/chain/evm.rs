//! EVM JSON-RPC backend
//!
//! Legacy (EIP-155) transfers signed locally and broadcast with
//! `eth_sendRawTransaction`. Token transfers use ERC-20 `transfer` calldata.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use alloy_primitives::{keccak256, Address, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{sol, SolCall};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::secrets::SigningKey;

use super::{Asset, ChainClient, ReceiptStatus, SignedTransaction, UnsignedTransfer};

/// Native currency precision on EVM chains
const NATIVE_DECIMALS: u32 = 18;

sol! {
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    status: Option<String>,
    block_number: Option<String>,
}

/// JSON-RPC client for an EVM chain
pub struct EvmChainClient {
    http: reqwest::Client,
    rpc_url: String,
    chain_id: u64,
    native: Asset,
    request_id: AtomicU64,
}

impl EvmChainClient {
    pub fn new(rpc_url: &str, chain_id: u64, native: Asset) -> Result<Self> {
        if rpc_url.trim().is_empty() {
            return Err(Error::Configuration("chain.rpc_url is empty".to_string()));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            rpc_url: rpc_url.to_string(),
            chain_id,
            native,
            request_id: AtomicU64::new(1),
        })
    }

    /// Raw JSON-RPC call; `Ok(None)` for a null result
    async fn rpc<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("{} request failed: {}", method, e)))?;

        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }

        let parsed: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| Error::Network(format!("{} response unreadable: {}", method, e)))?;

        if let Some(err) = parsed.error {
            debug!(method, code = err.code, "RPC error: {}", err.message);
            return Err(Error::Reverted(err.message));
        }
        Ok(parsed.result)
    }

    async fn rpc_required<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        self.rpc(method, params)
            .await?
            .ok_or_else(|| Error::Network(format!("{} returned no result", method)))
    }

    async fn block_number(&self) -> Result<u64> {
        let hex: String = self.rpc_required("eth_blockNumber", json!([])).await?;
        parse_quantity_u64(&hex)
    }

    /// Reads never revert; surface RPC errors as retryable
    fn read_error(e: Error) -> Error {
        match e {
            Error::Reverted(msg) => Error::Network(msg),
            other => other,
        }
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn name(&self) -> &str {
        "evm"
    }

    async fn get_balance(&self, address: &str, asset: &Asset) -> Result<Decimal> {
        let owner = parse_address(address)?;
        match asset {
            Asset::Native { .. } => self.get_native_balance(address).await,
            Asset::Token {
                contract, decimals, ..
            } => {
                let data = IERC20::balanceOfCall { account: owner }.abi_encode();
                let result: String = self
                    .rpc_required(
                        "eth_call",
                        json!([{ "to": contract, "data": format!("0x{}", hex::encode(data)) }, "latest"]),
                    )
                    .await
                    .map_err(Self::read_error)?;
                let bytes = hex::decode(result.trim_start_matches("0x"))
                    .map_err(|e| Error::Network(format!("Malformed balanceOf result: {}", e)))?;
                if bytes.len() < 32 {
                    return Err(Error::Network("Short balanceOf result".to_string()));
                }
                from_base_units(U256::from_be_slice(&bytes[..32]), *decimals)
            }
        }
    }

    async fn get_native_balance(&self, address: &str) -> Result<Decimal> {
        parse_address(address)?;
        let hex: String = self
            .rpc_required("eth_getBalance", json!([address, "latest"]))
            .await
            .map_err(Self::read_error)?;
        from_base_units(parse_quantity(&hex)?, NATIVE_DECIMALS)
    }

    async fn get_nonce(&self, address: &str) -> Result<u64> {
        parse_address(address)?;
        let hex: String = self
            .rpc_required("eth_getTransactionCount", json!([address, "pending"]))
            .await
            .map_err(Self::read_error)?;
        parse_quantity_u64(&hex)
    }

    fn sign(&self, key: &SigningKey, transfer: &UnsignedTransfer) -> Result<SignedTransaction> {
        if transfer.chain_id != self.chain_id {
            return Err(Error::Configuration(format!(
                "Transfer built for chain {}, client is on chain {}",
                transfer.chain_id, self.chain_id
            )));
        }

        let signer = PrivateKeySigner::from_slice(key.expose_secret())
            .map_err(|e| Error::Secret(format!("Invalid signing key: {}", e)))?;
        let from = parse_address(&transfer.from)?;
        if signer.address() != from {
            return Err(Error::Secret(format!(
                "Key does not control {}",
                transfer.from
            )));
        }

        let fields = LegacyFields::from_transfer(transfer)?;
        let sighash = keccak256(fields.signing_payload(self.chain_id));
        let signature = signer
            .sign_hash_sync(&sighash)
            .map_err(|e| Error::Secret(format!("Signing failed: {}", e)))?;

        let v = self.chain_id * 2 + 35 + u64::from(signature.v());
        let raw = fields.signed_payload(v, signature.r(), signature.s());
        let hash = format!("0x{}", hex::encode(keccak256(&raw)));

        Ok(SignedTransaction {
            hash,
            raw,
            transfer: transfer.clone(),
        })
    }

    async fn submit(&self, tx: &SignedTransaction) -> Result<String> {
        let raw = format!("0x{}", hex::encode(&tx.raw));
        match self
            .rpc::<String>("eth_sendRawTransaction", json!([raw]))
            .await
        {
            Ok(Some(hash)) => Ok(hash.to_lowercase()),
            Ok(None) => Ok(tx.hash.clone()),
            Err(Error::Reverted(msg)) if msg.to_lowercase().contains("already known") => {
                warn!(tx_hash = %tx.hash, "Transaction already known to node");
                Ok(tx.hash.clone())
            }
            Err(e) => Err(e),
        }
    }

    async fn receipt(&self, tx_hash: &str) -> Result<ReceiptStatus> {
        let receipt: Option<RpcReceipt> = self
            .rpc("eth_getTransactionReceipt", json!([tx_hash]))
            .await
            .map_err(Self::read_error)?;

        let Some(receipt) = receipt else {
            return Ok(ReceiptStatus::Unknown);
        };
        let Some(block_hex) = receipt.block_number else {
            return Ok(ReceiptStatus::Unknown);
        };
        if receipt.status.as_deref() == Some("0x0") {
            return Ok(ReceiptStatus::Reverted {
                reason: "execution reverted".to_string(),
            });
        }

        let block = parse_quantity_u64(&block_hex)?;
        let latest = self.block_number().await.map_err(Self::read_error)?;
        Ok(ReceiptStatus::Included {
            block,
            confirmations: latest.saturating_sub(block) + 1,
        })
    }
}

impl std::fmt::Debug for EvmChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmChainClient")
            .field("chain_id", &self.chain_id)
            .field("native", &self.native)
            .finish()
    }
}

/// Fields of a legacy transaction in RLP order
struct LegacyFields {
    nonce: u64,
    gas_price: U256,
    gas_limit: u64,
    to: Address,
    value: U256,
    data: Vec<u8>,
}

impl LegacyFields {
    fn from_transfer(transfer: &UnsignedTransfer) -> Result<Self> {
        let gas_price = to_base_units(transfer.gas_price_gwei, 9)?;
        let recipient = parse_address(&transfer.to)?;

        let (to, value, data) = match &transfer.asset {
            Asset::Native { .. } => (
                recipient,
                to_base_units(transfer.amount, NATIVE_DECIMALS)?,
                Vec::new(),
            ),
            Asset::Token {
                contract, decimals, ..
            } => {
                let amount = to_base_units(transfer.amount, *decimals)?;
                let data = IERC20::transferCall {
                    to: recipient,
                    amount,
                }
                .abi_encode();
                (parse_address(contract)?, U256::ZERO, data)
            }
        };

        Ok(Self {
            nonce: transfer.nonce,
            gas_price,
            gas_limit: transfer.gas_limit,
            to,
            value,
            data,
        })
    }

    fn common_fields(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(rlp::uint(U256::from(self.nonce)));
        out.extend(rlp::uint(self.gas_price));
        out.extend(rlp::uint(U256::from(self.gas_limit)));
        out.extend(rlp::bytes(self.to.as_slice()));
        out.extend(rlp::uint(self.value));
        out.extend(rlp::bytes(&self.data));
        out
    }

    /// EIP-155 payload hashed for signing
    fn signing_payload(&self, chain_id: u64) -> Vec<u8> {
        let mut body = self.common_fields();
        body.extend(rlp::uint(U256::from(chain_id)));
        body.extend(rlp::uint(U256::ZERO));
        body.extend(rlp::uint(U256::ZERO));
        rlp::list(&body)
    }

    fn signed_payload(&self, v: u64, r: U256, s: U256) -> Vec<u8> {
        let mut body = self.common_fields();
        body.extend(rlp::uint(U256::from(v)));
        body.extend(rlp::uint(r));
        body.extend(rlp::uint(s));
        rlp::list(&body)
    }
}

/// Minimal RLP encoder for transaction fields
mod rlp {
    use alloy_primitives::U256;

    fn length_prefix(len: usize, short_base: u8, long_base: u8) -> Vec<u8> {
        if len <= 55 {
            vec![short_base + len as u8]
        } else {
            let len_bytes: Vec<u8> = len
                .to_be_bytes()
                .iter()
                .copied()
                .skip_while(|b| *b == 0)
                .collect();
            let mut out = vec![long_base + len_bytes.len() as u8];
            out.extend(len_bytes);
            out
        }
    }

    pub fn bytes(data: &[u8]) -> Vec<u8> {
        if data.len() == 1 && data[0] < 0x80 {
            return data.to_vec();
        }
        let mut out = length_prefix(data.len(), 0x80, 0xb7);
        out.extend_from_slice(data);
        out
    }

    /// Big-endian integer without leading zeros
    pub fn uint(value: U256) -> Vec<u8> {
        let be = value.to_be_bytes::<32>();
        let first = be.iter().position(|b| *b != 0).unwrap_or(be.len());
        bytes(&be[first..])
    }

    pub fn list(encoded_items: &[u8]) -> Vec<u8> {
        let mut out = length_prefix(encoded_items.len(), 0xc0, 0xf7);
        out.extend_from_slice(encoded_items);
        out
    }
}

fn parse_address(address: &str) -> Result<Address> {
    Address::from_str(address).map_err(|_| Error::InvalidAddress(address.to_string()))
}

fn parse_quantity(hex: &str) -> Result<U256> {
    let digits = hex.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 16)
        .map_err(|e| Error::Network(format!("Malformed quantity {}: {}", hex, e)))
}

fn parse_quantity_u64(hex: &str) -> Result<u64> {
    let digits = hex.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| Error::Network(format!("Malformed quantity {}: {}", hex, e)))
}

/// Whole units to integer base units, truncating extra precision
pub fn to_base_units(amount: Decimal, decimals: u32) -> Result<U256> {
    if amount.is_sign_negative() {
        return Err(Error::Internal(format!("Negative amount: {}", amount)));
    }
    let text = amount.normalize().to_string();
    let (int_part, frac_part) = text.split_once('.').unwrap_or((text.as_str(), ""));

    let mut digits = String::with_capacity(int_part.len() + decimals as usize);
    digits.push_str(int_part);
    for i in 0..decimals as usize {
        digits.push(frac_part.as_bytes().get(i).map_or('0', |b| *b as char));
    }

    U256::from_str_radix(&digits, 10)
        .map_err(|e| Error::Internal(format!("Amount {} out of range: {}", amount, e)))
}

/// Integer base units to whole units
///
/// Fractional digits beyond `Decimal` precision are truncated.
pub fn from_base_units(value: U256, decimals: u32) -> Result<Decimal> {
    let digits = value.to_string();
    let decimals = decimals as usize;
    let (int_part, frac_part) = if digits.len() > decimals {
        let split = digits.len() - decimals;
        (digits[..split].to_string(), digits[split..].to_string())
    } else {
        ("0".to_string(), format!("{:0>width$}", digits, width = decimals))
    };

    let room = 28usize.saturating_sub(int_part.len());
    let frac: String = frac_part.chars().take(room).collect();
    let text = if frac.is_empty() {
        int_part
    } else {
        format!("{}.{}", int_part, frac)
    };

    Decimal::from_str(&text)
        .map(|d| d.normalize())
        .map_err(|e| Error::Network(format!("Balance {} out of range: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rlp_encoding() {
        assert_eq!(rlp::bytes(b"dog"), vec![0x83, b'd', b'o', b'g']);
        assert_eq!(rlp::bytes(&[]), vec![0x80]);
        assert_eq!(rlp::uint(U256::ZERO), vec![0x80]);
        assert_eq!(rlp::uint(U256::from(15u64)), vec![0x0f]);
        assert_eq!(rlp::uint(U256::from(1024u64)), vec![0x82, 0x04, 0x00]);

        let mut items = rlp::bytes(b"cat");
        items.extend(rlp::bytes(b"dog"));
        assert_eq!(
            rlp::list(&items),
            vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g']
        );
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(
            to_base_units(dec!(150.5), 6).unwrap(),
            U256::from(150_500_000u64)
        );
        assert_eq!(
            to_base_units(dec!(0.0000001), 6).unwrap(),
            U256::ZERO
        );
        assert_eq!(
            from_base_units(U256::from(1_500_000_000_000_000_000u128), 18).unwrap(),
            dec!(1.5)
        );
        assert_eq!(from_base_units(U256::from(5u64), 3).unwrap(), dec!(0.005));
        assert!(to_base_units(dec!(-1), 18).is_err());
    }

    #[test]
    fn test_eip155_signing_hash() {
        // Reference vector from the EIP-155 document
        let fields = LegacyFields {
            nonce: 9,
            gas_price: U256::from(20_000_000_000u64),
            gas_limit: 21_000,
            to: parse_address("0x3535353535353535353535353535353535353535").unwrap(),
            value: U256::from(1_000_000_000_000_000_000u128),
            data: Vec::new(),
        };
        let hash = keccak256(fields.signing_payload(1));
        assert_eq!(
            hex::encode(hash),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }

    #[test]
    fn test_quantity_parsing() {
        assert_eq!(parse_quantity_u64("0x1b4").unwrap(), 436);
        assert_eq!(parse_quantity("0x").unwrap(), U256::ZERO);
        assert!(parse_quantity_u64("0xzz").is_err());
    }
}
