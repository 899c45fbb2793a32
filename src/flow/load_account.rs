//! Account loading flow: initialize a fresh card if needed, then load a
//! BIP39 seed, generating the mnemonic on-card when none is supplied.

use coins_bip39::{English, Wordlist};
use serde_json::{json, Map};
use tracing::{debug, warn};

use super::context::{FlowAbort, FlowContext, FlowOutput};
use super::params::{errors, keys, signals};
use crate::crypto::bip39_seed;
use crate::types::Secrets;

pub(crate) fn execute(ctx: &FlowContext) -> FlowOutput {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;

    if !ctx.card().initialized {
        initialize_card(ctx)?;
    }

    ctx.authenticate(true)?;
    ctx.require_no_keys()?;

    let mnemonic = match ctx.param_str(keys::MNEMONIC) {
        Some(mnemonic) => mnemonic,
        None => generate_mnemonic(ctx)?,
    };
    let passphrase = ctx.param_str(keys::PASSPHRASE).unwrap_or_default();

    let seed = bip39_seed(&mnemonic, &passphrase);
    let key_uid = match ctx.command_set.lock().unwrap().load_seed(&seed) {
        Ok(key_uid) => key_uid,
        Err(e) => {
            warn!(error = %e, "seed load failed");
            return Err(FlowAbort::Fail(errors::LOAD_FAILED));
        }
    };

    let mut result = ctx.card_map();
    result.insert(
        keys::KEY_UID.into(),
        json!(format!("0x{}", hex::encode(key_uid))),
    );
    Ok(result)
}

/// Pre-initialized card: pause for confirmation and credentials, INIT,
/// then reconnect and select again so the flow continues against the
/// initialized applet.
fn initialize_card(ctx: &FlowContext) -> Result<(), FlowAbort> {
    debug!("card is pre-initialized; requesting initialization");
    ctx.pause_and_wait(signals::ENTER_NEW_PIN, errors::REQUIRE_INIT)?;

    let (Some(pin), Some(puk)) = (
        ctx.param_str(keys::NEW_PIN),
        ctx.param_str(keys::NEW_PUK),
    ) else {
        warn!("missing PIN or PUK for initialization");
        return Err(FlowAbort::Fail(errors::MISSING_CREDENTIALS));
    };
    let pairing_password = ctx.param_str(keys::PAIRING_PASS).unwrap_or_default();

    let secrets = Secrets::new(&pin, &puk, &pairing_password)
        .map_err(|_| FlowAbort::Fail(errors::MISSING_CREDENTIALS))?;
    if let Err(e) = ctx.command_set.lock().unwrap().init(&secrets) {
        warn!(error = %e, "card initialization failed");
        return Err(FlowAbort::Fail(errors::CARD_ERROR));
    }

    // Credentials changed; the connection must be re-established before
    // anything else touches the card.
    ctx.channel.disconnect();
    ctx.channel.force_scan();
    ctx.wait_for_card()?;
    ctx.select_keycard()?;

    // Authenticate with the PIN the card was just initialized with.
    ctx.set_param(keys::PIN, json!(secrets.pin()));
    Ok(())
}

/// Generate the mnemonic on-card and pause until the user has confirmed
/// the words.
fn generate_mnemonic(ctx: &FlowContext) -> Result<String, FlowAbort> {
    let length = ctx.param_u64(keys::MNEMONIC_LENGTH).unwrap_or(12);
    let checksum = match length {
        12 => 4,
        15 => 5,
        18 => 6,
        21 => 7,
        24 => 8,
        _ => return Err(FlowAbort::Fail(errors::GENERATE_FAILED)),
    };

    let indexes = match ctx.command_set.lock().unwrap().generate_mnemonic(checksum) {
        Ok(indexes) => indexes,
        Err(e) => {
            warn!(error = %e, "mnemonic generation failed");
            return Err(FlowAbort::Fail(errors::GENERATE_FAILED));
        }
    };

    let mut status = Map::new();
    status.insert(keys::MNEMONIC_INDEXES.into(), json!(indexes));
    ctx.pause_and_wait_with_status(signals::ENTER_MNEMONIC, errors::LOADING_KEYS, status)?;

    // The user may paste their own phrase on resume; otherwise expand the
    // generated indices through the English wordlist.
    if let Some(mnemonic) = ctx.param_str(keys::MNEMONIC) {
        return Ok(mnemonic);
    }
    let words: Result<Vec<&str>, _> = indexes
        .iter()
        .map(|&index| English::get(index as usize))
        .collect();
    match words {
        Ok(words) => Ok(words.join(" ")),
        Err(_) => Err(FlowAbort::Fail(errors::GENERATE_FAILED)),
    }
}
