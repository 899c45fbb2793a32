//! Account recovery flow: export the full key set needed to rebuild an
//! account from the card.

use serde_json::Value;

use super::context::{FlowContext, FlowOutput};
use super::export::export_key_json;
use super::params::keys;
use crate::command_set::ExportOption;
use crate::constants::paths;

pub(crate) fn execute(ctx: &FlowContext) -> FlowOutput {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;
    ctx.require_keys()?;
    ctx.authenticate(true)?;

    let supports_extended = ctx
        .card()
        .version
        .map(|v| v.supports_extended_keys())
        .unwrap_or(false);

    let encryption = export_key_json(ctx, paths::ENCRYPTION, true, ExportOption::PrivateAndPublic)?;
    let whisper = export_key_json(ctx, paths::WHISPER, false, ExportOption::PrivateAndPublic)?;
    let eip1581 = export_key_json(ctx, paths::EIP1581, false, ExportOption::PublicOnly)?;
    let wallet_root_option = if supports_extended {
        ExportOption::ExtendedPublic
    } else {
        ExportOption::PublicOnly
    };
    let wallet_root = export_key_json(ctx, paths::WALLET_ROOT, false, wallet_root_option)?;
    let wallet = export_key_json(ctx, paths::WALLET, false, ExportOption::PublicOnly)?;
    let master = export_key_json(ctx, paths::MASTER, false, ExportOption::PublicOnly)?;

    let mut result = ctx.card_map();
    result.insert(keys::ENCRYPTION_KEY.into(), Value::Object(encryption));
    result.insert(keys::WHISPER_KEY.into(), Value::Object(whisper));
    result.insert(keys::EIP1581_KEY.into(), Value::Object(eip1581));
    result.insert(keys::WALLET_ROOT_KEY.into(), Value::Object(wallet_root));
    result.insert(keys::WALLET_KEY.into(), Value::Object(wallet));
    result.insert(keys::MASTER_KEY.into(), Value::Object(master));
    Ok(result)
}
