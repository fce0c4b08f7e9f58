//! Identifier translation.
//!
//! protoc's C# generator renames everything it emits: `snake_case` fields
//! become `PascalCase` properties, enum values lose their enum-name prefix,
//! oneof discriminators gain a `Case` suffix. The helpers here run those
//! transformations backwards, optionally consulting an injected
//! [`NameLookup`] first (for de-obfuscation maps).
//!
//! An identifier of exactly eleven uppercase ASCII letters is the signature
//! of a common obfuscator; such names carry no case information and pass
//! through untouched.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const OBFUSCATED_NAME_LEN: usize = 11;
const ONEOF_CASE_SUFFIX: &str = "Case";

/// Source of human-readable names for compiled identifiers.
///
/// Implementations must be pure: the decompiler may ask for the same key
/// any number of times, at any depth of its traversal.
pub trait NameLookup {
    /// Returns the translated name for `key`, or `None` to fall back to heuristics
    fn lookup(&self, key: &str) -> Option<String>;
}

impl<F> NameLookup for F
where
    F: Fn(&str) -> Option<String>,
{
    fn lookup(&self, key: &str) -> Option<String> {
        self(key)
    }
}

/// A static name map, usually loaded from a JSON object of `"compiled": "original"` pairs
#[derive(Debug, Clone, Default)]
pub struct NameMap {
    names: HashMap<String, String>,
}

impl NameMap {
    /// Creates a map from pairs
    pub fn new(names: HashMap<String, String>) -> Self {
        Self { names }
    }

    /// Reads a JSON name map file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| Error::file_read(path, e))?;
        Ok(Self::new(serde_json::from_slice(&data)?))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True if the map has no entries
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl NameLookup for NameMap {
    fn lookup(&self, key: &str) -> Option<String> {
        self.names.get(key).cloned()
    }
}

/// Reduces a type or member name to its lookup key.
///
/// Generic argument lists and the `` `N `` arity suffix are dropped, then
/// only the last namespace/nesting segment is kept:
/// `` Ns.Outer+Inner`1[[System.String]] `` becomes `Inner`.
pub fn clean_lookup_key(name: &str) -> &str {
    let name = name.split('[').next().unwrap_or(name);
    let name = name.split('`').next().unwrap_or(name);
    name.rsplit(['.', '/', '+']).next().unwrap_or(name)
}

/// True for eleven-character all-uppercase ASCII identifiers
pub fn is_obfuscated(name: &str) -> bool {
    name.len() == OBFUSCATED_NAME_LEN && name.bytes().all(|b| b.is_ascii_uppercase())
}

/// `PascalCase` to `snake_case`: every ASCII uppercase letter after the
/// first character starts a new word.
pub fn to_snake_case_lower(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        out.extend(first.to_lowercase());
    }
    for c in chars {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// `PascalCase` to `SCREAMING_SNAKE_CASE`
pub fn to_snake_case_upper(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        out.extend(first.to_uppercase());
    }
    for c in chars {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c);
        } else {
            out.extend(c.to_uppercase());
        }
    }
    out
}

fn trim_case_suffix(name: &str) -> &str {
    name.strip_suffix(ONEOF_CASE_SUFFIX).unwrap_or(name)
}

/// Applies the translation rules with an optional lookup
#[derive(Clone, Copy, Default)]
pub struct NameTranslator<'a> {
    lookup: Option<&'a dyn NameLookup>,
}

impl<'a> NameTranslator<'a> {
    /// Creates a translator; `None` means heuristics only
    pub fn new(lookup: Option<&'a dyn NameLookup>) -> Self {
        Self { lookup }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        self.lookup?.lookup(clean_lookup_key(name))
    }

    // A lookup hit, or the name itself when it is obfuscated.
    fn translate(&self, name: &str) -> Option<String> {
        self.lookup(name)
            .or_else(|| is_obfuscated(name).then(|| name.to_owned()))
    }

    /// Message, enum and service names: looked up, else the simple name
    pub fn type_name(&self, name: &str) -> String {
        self.lookup(name)
            .unwrap_or_else(|| clean_lookup_key(name).to_owned())
    }

    /// Message field names
    pub fn field_name(&self, property: &str) -> String {
        self.translate(property)
            .unwrap_or_else(|| to_snake_case_lower(property))
    }

    /// Oneof group names, from the discriminator property name
    pub fn oneof_name(&self, property: &str) -> String {
        match self.translate(property) {
            Some(name) => trim_case_suffix(&name).to_owned(),
            None => to_snake_case_lower(trim_case_suffix(property)),
        }
    }

    /// Enum member names: `<ENUM>_<MEMBER>` unless translated.
    ///
    /// `enum_name` is the already translated name of the enum.
    pub fn enum_member_name(&self, member: &str, enum_name: &str) -> String {
        if let Some(name) = self.translate(member) {
            return name;
        }
        let prefix = if is_obfuscated(enum_name) {
            enum_name.to_owned()
        } else {
            to_snake_case_upper(enum_name)
        };
        format!("{}_{}", prefix, to_snake_case_upper(member))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_lookup_key() {
        assert_eq!(clean_lookup_key("Foo"), "Foo");
        assert_eq!(clean_lookup_key("App.Foo"), "Foo");
        assert_eq!(clean_lookup_key("App.Outer+Inner"), "Inner");
        assert_eq!(clean_lookup_key("App.Outer/Inner"), "Inner");
        assert_eq!(clean_lookup_key("Coll.RepeatedField`1[[System.String]]"), "RepeatedField");
    }

    #[test]
    fn test_is_obfuscated() {
        assert!(is_obfuscated("ABCDEFGHIJK"));
        assert!(!is_obfuscated("ABCDEFGHIJ"));
        assert!(!is_obfuscated("ABCDEFGHIJk"));
        assert!(!is_obfuscated("ABCDEFGHIJ1"));
    }

    #[test]
    fn test_snake_case() {
        assert_eq!(to_snake_case_lower("FooBarBaz"), "foo_bar_baz");
        assert_eq!(to_snake_case_lower("Id"), "id");
        assert_eq!(to_snake_case_lower("Value2"), "value2");
        assert_eq!(to_snake_case_lower(""), "");
        assert_eq!(to_snake_case_upper("PhoneType"), "PHONE_TYPE");
        assert_eq!(to_snake_case_upper("mobile"), "MOBILE");
        assert_eq!(to_snake_case_upper(""), "");
    }

    #[test]
    fn test_field_and_oneof_names() {
        let t = NameTranslator::default();
        assert_eq!(t.field_name("DisplayName"), "display_name");
        assert_eq!(t.field_name("ABCDEFGHIJK"), "ABCDEFGHIJK");
        assert_eq!(t.oneof_name("PayloadCase"), "payload");
        assert_eq!(t.oneof_name("KindOfThingCase"), "kind_of_thing");
        assert_eq!(t.oneof_name("ABCDEFGCase"), "a_b_c_d_e_f_g");
    }

    #[test]
    fn test_enum_member_names() {
        let t = NameTranslator::default();
        assert_eq!(t.enum_member_name("Mobile", "PhoneType"), "PHONE_TYPE_MOBILE");
        assert_eq!(t.enum_member_name("Home", "ABCDEFGHIJK"), "ABCDEFGHIJK_HOME");
        assert_eq!(t.enum_member_name("ABCDEFGHIJK", "PhoneType"), "ABCDEFGHIJK");
    }

    #[test]
    fn test_lookup_takes_priority() {
        let lookup = |key: &str| match key {
            "ABCDEFGHIJK" => Some("Person".to_owned()),
            "QWERTYUIOPA" => Some("ContactCase".to_owned()),
            _ => None,
        };
        let t = NameTranslator::new(Some(&lookup));
        assert_eq!(t.type_name("App.ABCDEFGHIJK"), "Person");
        assert_eq!(t.type_name("App.Outer+Plain"), "Plain");
        assert_eq!(t.oneof_name("QWERTYUIOPA"), "Contact");
    }

    #[test]
    fn test_name_map_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");
        fs::write(&path, r#"{"ABCDEFGHIJK":"Person"}"#).unwrap();
        let map = NameMap::from_path(&path).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.lookup("ABCDEFGHIJK").as_deref(), Some("Person"));
        assert_eq!(map.lookup("Other"), None);
    }
}
