//! Entity registry: which collections sync, in which order, with which capabilities

use regex::Regex;

use super::EntityType;
use crate::error::{Error, Result};

/// Payload field that carries the user-facing code of a record
pub const CODE_FIELD: &str = "code";

/// Provisional code capability for entity types with human-readable codes
#[derive(Debug, Clone)]
pub struct ProvisionalCodes {
    prefix: String,
    pattern: Regex,
}

impl ProvisionalCodes {
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.trim().is_empty() {
            return Err(Error::InvalidInput(
                "provisional code prefix must not be empty".to_string(),
            ));
        }
        let pattern = Regex::new(&format!(r"^{}-\d+$", regex::escape(&prefix)))
            .map_err(|error| Error::InvalidInput(error.to_string()))?;
        Ok(Self { prefix, pattern })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Format the `sequence`-th provisional code, e.g. `TBC-3`
    pub fn format(&self, sequence: i64) -> String {
        format!("{}-{sequence}", self.prefix)
    }

    /// Whether `code` looks like a code issued by this policy
    pub fn is_provisional(&self, code: &str) -> bool {
        self.pattern.is_match(code)
    }

    /// Sequence number of a provisional code, if it is one
    pub fn sequence_of(&self, code: &str) -> Option<i64> {
        if !self.is_provisional(code) {
            return None;
        }
        code.rsplit('-').next()?.parse().ok()
    }
}

/// A registered entity type
#[derive(Debug, Clone)]
pub struct EntityKind {
    pub entity_type: EntityType,
    pub provisional_codes: Option<ProvisionalCodes>,
}

impl EntityKind {
    pub const fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            provisional_codes: None,
        }
    }

    #[must_use]
    pub fn with_provisional_codes(mut self, codes: ProvisionalCodes) -> Self {
        self.provisional_codes = Some(codes);
        self
    }
}

/// Ordered set of entity types the engine manages
///
/// Registration order is the stable drain/pull order.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    kinds: Vec<EntityKind>,
}

impl EntityRegistry {
    pub const fn new() -> Self {
        Self { kinds: Vec::new() }
    }

    /// Registry for the Tourbook business domain
    ///
    /// Quotes and orders carry human-readable codes and therefore issue
    /// `TBC-<n>` placeholders while offline.
    pub fn tourbook_default() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(EntityKind::new(EntityType::new("customers")?))?;
        registry.register(EntityKind::new(EntityType::new("tours")?))?;
        registry.register(
            EntityKind::new(EntityType::new("quotes")?)
                .with_provisional_codes(ProvisionalCodes::new("TBC")?),
        )?;
        registry.register(
            EntityKind::new(EntityType::new("orders")?)
                .with_provisional_codes(ProvisionalCodes::new("TBC")?),
        )?;
        registry.register(EntityKind::new(EntityType::new("payments")?))?;
        registry.register(EntityKind::new(EntityType::new("messages")?))?;
        Ok(registry)
    }

    pub fn register(&mut self, kind: EntityKind) -> Result<()> {
        if self.get(&kind.entity_type).is_some() {
            return Err(Error::InvalidInput(format!(
                "entity type '{}' is already registered",
                kind.entity_type
            )));
        }
        self.kinds.push(kind);
        Ok(())
    }

    pub fn get(&self, entity_type: &EntityType) -> Option<&EntityKind> {
        self.kinds
            .iter()
            .find(|kind| &kind.entity_type == entity_type)
    }

    /// Look up a registered kind, failing for unknown types
    pub fn require(&self, entity_type: &EntityType) -> Result<&EntityKind> {
        self.get(entity_type)
            .ok_or_else(|| Error::UnknownEntityType(entity_type.to_string()))
    }

    /// Registered kinds in drain order
    pub fn kinds(&self) -> impl Iterator<Item = &EntityKind> {
        self.kinds.iter()
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.kinds.iter().map(|kind| &kind.entity_type)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_order_is_stable() {
        let registry = EntityRegistry::tourbook_default().unwrap();
        let names: Vec<&str> = registry.entity_types().map(EntityType::as_str).collect();
        assert_eq!(
            names,
            vec!["customers", "tours", "quotes", "orders", "payments", "messages"]
        );
    }

    #[test]
    fn test_provisional_codes_only_for_coded_kinds() {
        let registry = EntityRegistry::tourbook_default().unwrap();
        let orders = registry.get(&EntityType::new("orders").unwrap()).unwrap();
        let tours = registry.get(&EntityType::new("tours").unwrap()).unwrap();
        assert!(orders.provisional_codes.is_some());
        assert!(tours.provisional_codes.is_none());
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = EntityRegistry::new();
        registry
            .register(EntityKind::new(EntityType::new("tours").unwrap()))
            .unwrap();
        assert!(registry
            .register(EntityKind::new(EntityType::new("tours").unwrap()))
            .is_err());
    }

    #[test]
    fn test_provisional_code_format_and_match() {
        let codes = ProvisionalCodes::new("TBC").unwrap();
        assert_eq!(codes.format(7), "TBC-7");
        assert!(codes.is_provisional("TBC-7"));
        assert!(!codes.is_provisional("R-7"));
        assert!(!codes.is_provisional("TBC-"));
        assert_eq!(codes.sequence_of("TBC-12"), Some(12));
        assert_eq!(codes.sequence_of("ORD-12"), None);
    }

    #[test]
    fn test_require_unknown_type() {
        let registry = EntityRegistry::tourbook_default().unwrap();
        let err = registry
            .require(&EntityType::new("invoices").unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("invoices"));
    }
}
