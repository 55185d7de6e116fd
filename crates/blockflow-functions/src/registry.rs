use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::schema::{Schema, ANY_SCHEMA_KEY};
use blockflow_core::traits::SchemaCatalog;

use crate::function::FunctionDef;

/// Namespace searched first for unqualified keys.
pub const LOCAL_NAMESPACE: &str = "_local";

/// Namespaced lookup of function definitions and schemas.
pub struct ComponentRegistry {
    functions: HashMap<String, Arc<FunctionDef>>,
    schemas: HashMap<String, Arc<Schema>>,
    namespace_precedence: Vec<String>,
    catalog: Option<Arc<dyn SchemaCatalog>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            functions: HashMap::new(),
            schemas: HashMap::new(),
            namespace_precedence: vec![LOCAL_NAMESPACE.to_string()],
            catalog: None,
        };
        registry.register_schema(Schema::any());
        registry
    }

    /// Put `namespaces` at the front of the search order.
    pub fn set_namespace_precedence(&mut self, namespaces: &[String]) {
        let mut order: Vec<String> = namespaces.to_vec();
        for ns in self.namespace_precedence.drain(..) {
            if !order.contains(&ns) {
                order.push(ns);
            }
        }
        self.namespace_precedence = order;
    }

    pub fn namespace_precedence(&self) -> &[String] {
        &self.namespace_precedence
    }

    /// Fallback consulted for schema keys the registry does not hold.
    pub fn set_catalog(&mut self, catalog: Arc<dyn SchemaCatalog>) {
        self.catalog = Some(catalog);
    }

    fn add_namespace(&mut self, namespace: &str) {
        if !self.namespace_precedence.iter().any(|ns| ns == namespace) {
            self.namespace_precedence.push(namespace.to_string());
        }
    }

    /// Register a function under `namespace.name`.
    pub fn register_function(&mut self, def: FunctionDef) -> Arc<FunctionDef> {
        let key = def.key();
        self.add_namespace(&def.namespace);
        let def = Arc::new(def);
        if self.functions.insert(key.clone(), def.clone()).is_some() {
            debug!(key = %key, "Replaced function definition");
        }
        def
    }

    pub fn register_schema(&mut self, schema: Schema) -> Arc<Schema> {
        if let Some(ns) = schema.namespace() {
            let ns = ns.to_string();
            self.add_namespace(&ns);
        }
        let schema = Arc::new(schema);
        self.schemas.insert(schema.key.clone(), schema.clone());
        schema
    }

    pub fn resolve_function(&self, key: &str) -> Result<Arc<FunctionDef>> {
        lookup(&self.functions, &self.namespace_precedence, key)
            .ok_or_else(|| BlockflowError::not_found("Function", key))
    }

    pub fn resolve_schema(&self, key: &str) -> Result<Arc<Schema>> {
        let key = if key == "Any" { ANY_SCHEMA_KEY } else { key };
        if let Some(schema) = lookup(&self.schemas, &self.namespace_precedence, key) {
            return Ok(schema);
        }
        if let Some(catalog) = &self.catalog {
            if let Some(schema) = catalog.get_schema(key)? {
                return Ok(Arc::new(schema));
            }
        }
        Err(BlockflowError::not_found("Schema", key))
    }

    pub fn function_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.functions.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    pub fn schema_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.schemas.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    /// Create a registry with the `core` functions registered.
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        crate::builtin::register_builtins(&mut registry)?;
        Ok(registry)
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exact key first, then `namespace.key` for each namespace in order.
fn lookup<T>(map: &HashMap<String, Arc<T>>, precedence: &[String], key: &str) -> Option<Arc<T>> {
    if let Some(found) = map.get(key) {
        return Some(found.clone());
    }
    if key.contains('.') {
        return None;
    }
    precedence
        .iter()
        .find_map(|ns| map.get(&format!("{}.{}", ns, key)).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Output;
    use crate::interface::Signature;
    use blockflow_core::schema::{Field, FieldType};

    fn noop(ns: &str, name: &str) -> FunctionDef {
        FunctionDef::new(ns, name, Signature::new(), |_args| Ok(Output::None)).unwrap()
    }

    struct StaticCatalog;

    impl SchemaCatalog for StaticCatalog {
        fn get_schema(&self, key: &str) -> Result<Option<Schema>> {
            Ok((key == "_generated.Seen").then(|| Schema::new(key, vec![])))
        }
    }

    #[test]
    fn test_exact_and_namespace_lookup() {
        let mut reg = ComponentRegistry::new();
        reg.register_function(noop("shop", "clean"));
        reg.register_function(noop("core", "clean"));

        assert_eq!(reg.resolve_function("shop.clean").unwrap().namespace, "shop");
        // core is known from core.Any, so it precedes shop
        assert_eq!(reg.resolve_function("clean").unwrap().namespace, "core");

        reg.set_namespace_precedence(&["shop".to_string()]);
        assert_eq!(reg.namespace_precedence()[0], "shop");
        assert_eq!(reg.resolve_function("clean").unwrap().namespace, "shop");
    }

    #[test]
    fn test_unknown_key_is_not_found() {
        let reg = ComponentRegistry::new();
        let err = reg.resolve_function("nope").unwrap_err();
        assert!(matches!(err, BlockflowError::NotFound { .. }));
        assert!(reg.resolve_schema("shop.Missing").is_err());
    }

    #[test]
    fn test_schema_resolution() {
        let mut reg = ComponentRegistry::new();
        reg.register_schema(Schema::new(
            "shop.Customer",
            vec![Field::new("name", FieldType::Text)],
        ));
        assert_eq!(reg.resolve_schema("Customer").unwrap().key, "shop.Customer");
        assert_eq!(reg.resolve_schema("Any").unwrap().key, ANY_SCHEMA_KEY);
        assert!(reg.schema_keys().contains(&ANY_SCHEMA_KEY));
    }

    #[test]
    fn test_catalog_fallback() {
        let mut reg = ComponentRegistry::new();
        assert!(reg.resolve_schema("_generated.Seen").is_err());
        reg.set_catalog(Arc::new(StaticCatalog));
        assert_eq!(reg.resolve_schema("_generated.Seen").unwrap().key, "_generated.Seen");
    }
}
