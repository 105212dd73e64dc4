//! Config layer merging
//!
//! Layers are applied lowest precedence first: builtin defaults, then
//! platform-detected overrides, then operator config. Objects merge key by
//! key; any other value from a later layer replaces the earlier one.

use serde_json::{json, Value};

/// Defaults applied before any platform or operator layer
pub fn builtin_config() -> Value {
    json!({
        "ssh_pwauth": false,
        "disable_root": true,
        "manage_etc_hosts": false,
        "system_info": {
            "default_user": {"name": "cloud-user", "lock_passwd": true},
        },
    })
}

/// Merge `overlay` into `base` in place
pub fn merge_into(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        // an absent layer leaves the base untouched
        (_, Value::Null) => {}
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Merge layers in ascending precedence
pub fn merge_layers(layers: &[&Value]) -> Value {
    let mut merged = Value::Object(Default::default());
    for layer in layers {
        merge_into(&mut merged, layer);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_builtin_platform_operator() {
        let builtin = builtin_config();
        let platform = json!({
            "ssh_pwauth": true,
            "system_info": {"default_user": {"name": "azureuser", "lock_passwd": false}},
        });
        let operator = json!({"system_info": {"default_user": {"name": "ops"}}});

        let merged = merge_layers(&[&builtin, &platform, &operator]);
        assert_eq!(merged["ssh_pwauth"], json!(true));
        assert_eq!(merged["disable_root"], json!(true));
        assert_eq!(merged["system_info"]["default_user"]["name"], json!("ops"));
        assert_eq!(merged["system_info"]["default_user"]["lock_passwd"], json!(false));
    }

    #[test]
    fn test_null_layer_is_ignored() {
        let merged = merge_layers(&[&json!({"a": 1}), &Value::Null]);
        assert_eq!(merged, json!({"a": 1}));
    }

    #[test]
    fn test_lists_are_replaced_not_concatenated() {
        let merged = merge_layers(&[&json!({"ntp": ["a", "b"]}), &json!({"ntp": ["c"]})]);
        assert_eq!(merged, json!({"ntp": ["c"]}));
    }
}
