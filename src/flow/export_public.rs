//! Public key export flow. Accepts one path or an array of paths and
//! mirrors the input shape in the result.

use serde_json::{Map, Value};

use super::context::{FlowAbort, FlowContext, FlowOutput};
use super::export::export_key_json;
use super::params::{errors, keys, signals};
use crate::command_set::ExportOption;

pub(crate) fn execute(ctx: &FlowContext) -> FlowOutput {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;
    ctx.require_keys()?;
    ctx.authenticate(true)?;

    let (mut paths, mut input_was_array) = read_paths(ctx);
    if paths.is_empty() {
        ctx.pause_and_wait(signals::ENTER_PATH, errors::MISSING_CREDENTIALS)?;
        (paths, input_was_array) = read_paths(ctx);
        if paths.is_empty() {
            return Err(FlowAbort::Fail(errors::MISSING_CREDENTIALS));
        }
    }

    let mut exported = Vec::with_capacity(paths.len());
    for path in &paths {
        let key = export_key_json(ctx, path, false, ExportOption::PublicOnly)?;
        exported.push(Value::Object(key));
    }

    let mut result = ctx.card_map();
    let value = if input_was_array {
        Value::Array(exported)
    } else {
        exported.into_iter().next().unwrap()
    };
    result.insert(keys::EXPORTED_KEY.into(), value);
    Ok(result)
}

fn read_paths(ctx: &FlowContext) -> (Vec<String>, bool) {
    match ctx.param(keys::BIP44_PATH) {
        Some(Value::Array(values)) => (
            values
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            true,
        ),
        Some(Value::String(path)) if !path.is_empty() => (vec![path], false),
        _ => (Vec::new(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn read_paths_mirrors_input_shape() {
        use crate::channel::{Channel, MockKeycard};
        use crate::flow::state::FlowStateMachine;
        use crate::signal::SignalBus;
        use crate::storage::PairingStore;
        use crate::CommandSet;
        use std::sync::{Arc, Mutex};

        let channel = Arc::new(MockKeycard::new());
        let dir = tempfile::tempdir().unwrap();
        let make_ctx = |params: Map<String, Value>| {
            FlowContext::new(
                Arc::new(FlowStateMachine::default()),
                Arc::new(SignalBus::new()),
                channel.clone() as Arc<dyn Channel>,
                Arc::new(Mutex::new(CommandSet::new(channel.clone()))),
                Arc::new(Mutex::new(PairingStore::new(dir.path().join("p.json")))),
                params,
            )
        };

        let mut params = Map::new();
        params.insert(keys::BIP44_PATH.into(), json!("m/44'/60'/0'/0/1"));
        let (paths, was_array) = read_paths(&make_ctx(params));
        assert_eq!(paths, vec!["m/44'/60'/0'/0/1".to_string()]);
        assert!(!was_array);

        let mut params = Map::new();
        params.insert(
            keys::BIP44_PATH.into(),
            json!(["m/44'/60'/0'/0/1", "m/44'/60'/0'/0/2"]),
        );
        let (paths, was_array) = read_paths(&make_ctx(params));
        assert_eq!(paths.len(), 2);
        assert!(was_array);
    }
}
