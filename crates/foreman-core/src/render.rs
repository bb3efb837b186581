//! Resolves [`Renderable`] values against a live [`PropertyBag`].
//!
//! A step's command arguments are rendered exactly once, immediately
//! before the step starts, against the properties as they stand at
//! that point in the build -- not re-resolved mid-step, so a step that
//! mutates a property it also consumed as an argument sees the value
//! it started with.

use std::collections::BTreeMap;

use foreman_types::{PropertyBag, Renderable};
use serde_json::Value;

/// Replace every `%(prop:name)s` occurrence in `template` with the
/// stringified value of `name` in `properties`. A reference to a
/// missing property is left untouched, matching the source system's
/// behavior of failing the render loudly only when the whole argument
/// dict is consumed, which `foreman-core` leaves to the worker side.
pub fn render_template_string(template: &str, properties: &PropertyBag) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        match rest.find("%(prop:") {
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start + "%(prop:".len()..];
                match after.find(")s") {
                    Some(end) => {
                        let name = &after[..end];
                        match properties.get(name) {
                            Some(Value::String(s)) => out.push_str(s),
                            Some(v) => out.push_str(&v.to_string()),
                            None => out.push_str(&template[start..start + "%(prop:".len() + end + 2]),
                        }
                        rest = &after[end + 2..];
                    }
                    None => {
                        out.push_str(&rest[start..]);
                        break;
                    }
                }
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out
}

/// Resolve one renderable value against `properties`.
pub fn render_value(renderable: &Renderable<Value>, properties: &PropertyBag) -> Value {
    match renderable {
        Renderable::Value(v) => v.clone(),
        Renderable::Template(s) => Value::String(render_template_string(s, properties)),
    }
}

/// Resolve a whole args map, as carried on a `StepTemplate`, into a
/// plain JSON object ready to hand to [`crate::transport::WorkerConnection`].
pub fn render_args(args: &BTreeMap<String, Renderable<Value>>, properties: &PropertyBag) -> Value {
    let mut map = serde_json::Map::with_capacity(args.len());
    for (k, v) in args {
        map.insert(k.clone(), render_value(v, properties));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_types::PropertySource;

    fn bag() -> PropertyBag {
        let mut b = PropertyBag::new();
        b.set("branch", serde_json::json!("main"), PropertySource::Master);
        b.set("revision", serde_json::json!("deadbeef"), PropertySource::Master);
        b
    }

    #[test]
    fn substitutes_known_property() {
        let out = render_template_string("checkout %(prop:branch)s", &bag());
        assert_eq!(out, "checkout main");
    }

    #[test]
    fn leaves_unknown_property_reference_untouched() {
        let out = render_template_string("%(prop:missing)s", &bag());
        assert_eq!(out, "%(prop:missing)s");
    }

    #[test]
    fn handles_multiple_references() {
        let out = render_template_string("%(prop:branch)s@%(prop:revision)s", &bag());
        assert_eq!(out, "main@deadbeef");
    }

    #[test]
    fn literal_value_passes_through_unchanged() {
        let v = Renderable::Value(serde_json::json!(["a", "b"]));
        assert_eq!(render_value(&v, &bag()), serde_json::json!(["a", "b"]));
    }

    #[test]
    fn render_args_builds_object() {
        let mut args = BTreeMap::new();
        args.insert("cmd".to_string(), Renderable::Template("git checkout %(prop:branch)s".to_string()));
        args.insert("timeout".to_string(), Renderable::Value(serde_json::json!(60)));
        let rendered = render_args(&args, &bag());
        assert_eq!(rendered["cmd"], serde_json::json!("git checkout main"));
        assert_eq!(rendered["timeout"], serde_json::json!(60));
    }
}
