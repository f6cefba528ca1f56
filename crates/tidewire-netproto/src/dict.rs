use std::collections::{BTreeMap, HashMap};

use serde::{Serialize, Serializer};

use crate::error::ProtoError;

/// Bidirectional route ↔ alias table used for route compression.
///
/// Aliases start at 1 and increase by one per newly inserted route; an
/// inserted route keeps its alias for the lifetime of the dictionary.
#[derive(Debug, Clone, Default)]
pub struct RouteDict {
    routes: BTreeMap<String, u16>,
    codes: HashMap<u16, String>,
}

impl RouteDict {
    /// Aliases are non-zero `u16`s.
    pub const MAX_ROUTES: usize = u16::MAX as usize;

    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `route`, returning its alias. An existing route keeps its alias.
    pub fn insert(&mut self, route: &str) -> Result<u16, ProtoError> {
        if let Some(&code) = self.routes.get(route) {
            return Ok(code);
        }
        let code = u16::try_from(self.routes.len() + 1)
            .map_err(|_| ProtoError::RouteDictFull(Self::MAX_ROUTES))?;
        self.routes.insert(route.to_owned(), code);
        self.codes.insert(code, route.to_owned());
        Ok(code)
    }

    /// Number of aliases still free.
    pub fn remaining(&self) -> usize {
        Self::MAX_ROUTES - self.routes.len()
    }

    pub fn code(&self, route: &str) -> Option<u16> {
        self.routes.get(route).copied()
    }

    pub fn route(&self, code: u16) -> Option<&str> {
        self.codes.get(&code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u16)> {
        self.routes.iter().map(|(r, &c)| (r.as_str(), c))
    }
}

/// Serialized as a `{ route: alias }` object, the shape clients expect in the
/// handshake response.
impl Serialize for RouteDict {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.routes.serialize(serializer)
    }
}
