//! Entity keys: an app id, an optional namespace, and an ordered path of
//! (kind, identifier) pairs.

use std::fmt;

use errors::ClientError;
use serde::{
    Deserialize,
    Serialize,
};

/// One path element's identifier. `Unassigned` marks an incomplete element;
/// the store assigns a numeric id at write time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Id {
    Unassigned,
    Int(i64),
    Str(String),
}

impl Id {
    pub fn is_assigned(&self) -> bool {
        !matches!(self, Id::Unassigned)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathElement {
    pub kind: String,
    pub id: Id,
}

impl PathElement {
    pub fn new(kind: impl Into<String>, id: Id) -> Self {
        Self {
            kind: kind.into(),
            id,
        }
    }
}

/// A fully qualified entity key.
///
/// Invariant: the path is non-empty and only its last element may be
/// unassigned. A key is complete iff its last identifier is assigned.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    app: String,
    namespace: Option<String>,
    path: Vec<PathElement>,
}

impl Key {
    pub fn new(
        app: impl Into<String>,
        namespace: Option<String>,
        path: Vec<PathElement>,
    ) -> anyhow::Result<Self> {
        if path.is_empty() {
            return Err(ClientError::validation("key path must be non-empty"));
        }
        for element in &path {
            if element.kind.is_empty() {
                return Err(ClientError::validation("key path kind must be non-empty"));
            }
        }
        if path[..path.len() - 1].iter().any(|e| !e.id.is_assigned()) {
            return Err(ClientError::validation(
                "only the last key path element may be unassigned",
            ));
        }
        Ok(Self {
            app: app.into(),
            namespace,
            path,
        })
    }

    /// Single-element key, the common case.
    pub fn simple(app: impl Into<String>, kind: impl Into<String>, id: Id) -> Self {
        Self {
            app: app.into(),
            namespace: None,
            path: vec![PathElement::new(kind, id)],
        }
    }

    /// Extend this key with a child element.
    pub fn child(&self, kind: impl Into<String>, id: Id) -> anyhow::Result<Self> {
        if !self.is_complete() {
            return Err(ClientError::validation(
                "cannot extend an incomplete key with a child",
            ));
        }
        let mut path = self.path.clone();
        path.push(PathElement::new(kind, id));
        Ok(Self {
            app: self.app.clone(),
            namespace: self.namespace.clone(),
            path,
        })
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn path(&self) -> &[PathElement] {
        &self.path
    }

    /// The last path element's kind.
    pub fn kind(&self) -> &str {
        &self.path.last().expect("key path is non-empty").kind
    }

    /// The last path element's identifier.
    pub fn id(&self) -> &Id {
        &self.path.last().expect("key path is non-empty").id
    }

    pub fn is_complete(&self) -> bool {
        self.id().is_assigned()
    }

    pub fn parent(&self) -> Option<Key> {
        if self.path.len() < 2 {
            return None;
        }
        Some(Self {
            app: self.app.clone(),
            namespace: self.namespace.clone(),
            path: self.path[..self.path.len() - 1].to_vec(),
        })
    }

    /// The entity-group key: the root of this key's ancestor path.
    pub fn root(&self) -> Key {
        Self {
            app: self.app.clone(),
            namespace: self.namespace.clone(),
            path: self.path[..1].to_vec(),
        }
    }

    /// This key with a store-assigned numeric id in the last position.
    pub fn with_assigned_id(&self, id: i64) -> Key {
        let mut path = self.path.clone();
        path.last_mut().expect("key path is non-empty").id = Id::Int(id);
        Self {
            app: self.app.clone(),
            namespace: self.namespace.clone(),
            path,
        }
    }

    /// True iff `other` lies in this key's subtree (self included).
    pub fn is_ancestor_of(&self, other: &Key) -> bool {
        self.app == other.app
            && self.namespace == other.namespace
            && other.path.len() >= self.path.len()
            && other.path[..self.path.len()] == self.path[..]
    }

    /// Canonical string form used as the shared-cache key. Distinct keys map
    /// to distinct tokens: reserved characters inside string components are
    /// escaped and identifier variants are tagged.
    pub fn cache_token(&self) -> String {
        let mut token = escape(&self.app);
        token.push('!');
        if let Some(ns) = &self.namespace {
            token.push_str(&escape(ns));
        }
        for element in &self.path {
            token.push('!');
            token.push_str(&escape(&element.kind));
            token.push(':');
            match &element.id {
                Id::Unassigned => token.push('_'),
                Id::Int(id) => token.push_str(&format!("i{id}")),
                Id::Str(name) => {
                    token.push('s');
                    token.push_str(&escape(name));
                },
            }
        }
        token
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ns) = &self.namespace {
            write!(f, "[{ns}]")?;
        }
        for (i, element) in self.path.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            match &element.id {
                Id::Unassigned => write!(f, "{}:*", element.kind)?,
                Id::Int(id) => write!(f, "{}:{id}", element.kind)?,
                Id::Str(name) => write!(f, "{}:{name:?}", element.kind)?,
            }
        }
        Ok(())
    }
}

/// Percent-escape the characters the token format reserves.
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '!' => out.push_str("%21"),
            ':' => out.push_str("%3a"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
fn unescape(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let hex: String = chars.by_ref().take(2).collect();
        let code = u8::from_str_radix(&hex, 16).expect("invalid escape");
        out.push(code as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        escape,
        unescape,
        Id,
        Key,
        PathElement,
    };

    fn key(kind: &str, id: Id) -> Key {
        Key::simple("app", kind, id)
    }

    #[test]
    fn test_completeness() {
        assert!(key("Foo", Id::Int(1)).is_complete());
        assert!(key("Foo", Id::Str("a".to_string())).is_complete());
        assert!(!key("Foo", Id::Unassigned).is_complete());
    }

    #[test]
    fn test_only_last_element_may_be_unassigned() {
        let err = Key::new(
            "app",
            None,
            vec![
                PathElement::new("Parent", Id::Unassigned),
                PathElement::new("Child", Id::Int(1)),
            ],
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<errors::ClientError>(),
            Some(errors::ClientError::Validation(_))
        ));

        Key::new(
            "app",
            None,
            vec![
                PathElement::new("Parent", Id::Int(1)),
                PathElement::new("Child", Id::Unassigned),
            ],
        )
        .unwrap();
    }

    #[test]
    fn test_parent_and_root() {
        let parent = key("Parent", Id::Int(1));
        let child = parent.child("Child", Id::Str("c".to_string())).unwrap();
        assert_eq!(child.parent().unwrap(), parent);
        assert_eq!(child.root(), parent);
        assert_eq!(parent.parent(), None);
        assert!(parent.is_ancestor_of(&child));
        assert!(!child.is_ancestor_of(&parent));
    }

    #[test]
    fn test_with_assigned_id() {
        let incomplete = key("Foo", Id::Unassigned);
        let complete = incomplete.with_assigned_id(42);
        assert!(complete.is_complete());
        assert_eq!(complete.id(), &Id::Int(42));
        assert_eq!(complete.kind(), "Foo");
    }

    #[test]
    fn test_cache_tokens_distinguish_id_variants() {
        let int_key = key("Foo", Id::Int(1));
        let str_key = key("Foo", Id::Str("1".to_string()));
        assert_ne!(int_key.cache_token(), str_key.cache_token());
    }

    #[test]
    fn test_cache_tokens_escape_reserved_characters() {
        let tricky = key("Foo", Id::Str("a!b:c".to_string()));
        let flat = key("Foo", Id::Str("a".to_string()));
        let nested = flat.child("b", Id::Str("c".to_string()));
        // Escaping keeps the tricky single-element key distinct from any
        // nested path that would collide unescaped.
        assert!(nested.is_ok());
        assert_ne!(tricky.cache_token(), nested.unwrap().cache_token());
    }

    proptest! {
        #[test]
        fn proptest_escape_round_trips(raw in "\\PC*") {
            prop_assert_eq!(unescape(&escape(&raw)), raw);
        }

        #[test]
        fn proptest_escaped_strings_have_no_reserved_chars(raw in "\\PC*") {
            let escaped = escape(&raw);
            prop_assert!(!escaped.contains('!'));
            prop_assert!(!escaped.contains(':'));
        }
    }
}
