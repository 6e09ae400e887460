use std::collections::HashSet;

use evalsession_core::session_api::Inspection;

use crate::value::{Value, ValueKind};

/// Build the structured inspection of a value.
pub fn inspect(value: &dyn Value) -> Inspection {
    match value.kind() {
        ValueKind::Undefined => Inspection {
            string: "undefined".to_string(),
            type_: "Undefined".to_string(),
            constructor_list: None,
            length: None,
        },
        ValueKind::Null => Inspection {
            string: "null".to_string(),
            type_: "Null".to_string(),
            constructor_list: None,
            length: None,
        },
        ValueKind::Boolean => wrapped(value, "Boolean", false),
        ValueKind::Number => wrapped(value, "Number", false),
        ValueKind::String => wrapped(value, "String", true),
        ValueKind::Function => wrapped(value, "Function", true),
        ValueKind::Object => {
            let constructors = constructor_list(value);
            let type_ = constructors.first().cloned().unwrap_or_default();
            let string = value.string_value().unwrap_or_else(|| value.inspect());
            Inspection {
                string,
                type_,
                constructor_list: Some(constructors),
                length: value.length(),
            }
        }
    }
}

fn wrapped(value: &dyn Value, wrapper: &str, with_length: bool) -> Inspection {
    Inspection {
        string: value.inspect(),
        type_: wrapper.to_string(),
        constructor_list: Some(vec![wrapper.to_string(), "Object".to_string()]),
        length: if with_length { value.length() } else { None },
    }
}

/// Walk the prototype chain reading the constructor's name at each step,
/// stopping on a prototype with no readable constructor.
pub fn constructor_list(value: &dyn Value) -> Vec<String> {
    let mut list = Vec::new();
    let mut cursor = value.prototype();
    while let Some(prototype) = cursor {
        match prototype.constructor_name() {
            Some(name) => list.push(name),
            None => break,
        }
        cursor = prototype.prototype();
    }
    list
}

/// Enumerate all property names reachable along the prototype chain. Own
/// names are sorted per level and appended if not already present; the walk
/// terminates on a null prototype or when a prototype repeats.
pub fn all_property_names(value: &dyn Value) -> Vec<String> {
    let mut names = Vec::new();
    let mut visited = HashSet::new();
    let mut cursor = match value.kind() {
        ValueKind::Undefined | ValueKind::Null => return names,
        // Primitives start at the wrapper prototype.
        ValueKind::Boolean | ValueKind::Number | ValueKind::String => value.prototype(),
        ValueKind::Function | ValueKind::Object => {
            visited.insert(value.identity());
            collect_level(value, &mut names);
            value.prototype()
        }
    };
    while let Some(level) = cursor {
        if !visited.insert(level.identity()) {
            break;
        }
        collect_level(level.as_ref(), &mut names);
        cursor = level.prototype();
    }
    names
}

fn collect_level(value: &dyn Value, names: &mut Vec<String>) {
    let mut own = value.own_property_names();
    own.sort();
    for name in own {
        if !names.contains(&name) {
            names.push(name);
        }
    }
}
