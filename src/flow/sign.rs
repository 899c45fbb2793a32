//! Signing flow: ECDSA over a caller-supplied 32-byte hash.

use serde_json::Value;
use tracing::warn;

use super::context::{FlowAbort, FlowContext, FlowOutput};
use super::params::{errors, keys, signals};

pub(crate) fn execute(ctx: &FlowContext) -> FlowOutput {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;
    ctx.require_keys()?;
    ctx.authenticate(true)?;

    let mut hash_hex = ctx.param_str(keys::TX_HASH);
    let mut path_str = ctx.param_str(keys::BIP44_PATH);
    if hash_hex.is_none() || path_str.is_none() {
        ctx.pause_and_wait(signals::ENTER_PATH, errors::MISSING_CREDENTIALS)?;
        hash_hex = ctx.param_str(keys::TX_HASH);
        path_str = ctx.param_str(keys::BIP44_PATH);
    }
    let (Some(hash_hex), Some(path_str)) = (hash_hex, path_str) else {
        return Err(FlowAbort::Fail(errors::MISSING_CREDENTIALS));
    };

    let hash: [u8; 32] = hex::decode(hash_hex.trim_start_matches("0x"))
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(FlowAbort::Fail(errors::CARD_ERROR))?;
    let path = path_str
        .parse()
        .map_err(|_| FlowAbort::Fail(errors::CARD_ERROR))?;

    let signature = match ctx.command_set.lock().unwrap().sign(&hash, &path) {
        Ok(signature) => signature,
        Err(e) => {
            warn!(error = %e, "signing failed");
            return Err(FlowAbort::Fail(errors::CARD_ERROR));
        }
    };

    let mut result = ctx.card_map();
    result.insert(keys::TX_SIGNATURE.into(), signature.to_json());
    result.insert(keys::BIP44_PATH.into(), Value::String(path_str));
    Ok(result)
}
