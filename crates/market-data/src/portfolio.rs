use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::PortfolioError;
use crate::security::Security;

/// Symbol-keyed collection of securities.
///
/// Iteration order is lexicographic by symbol, which keeps downstream
/// bootstraps reproducible across runs.
#[derive(Debug, Clone, Default)]
pub struct Portfolio {
    name: String,
    securities: BTreeMap<String, Arc<Security>>,
}

impl Portfolio {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            securities: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.securities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.securities.is_empty()
    }

    /// Add a security; a duplicate symbol is an error.
    pub fn add(&mut self, security: Arc<Security>) -> Result<(), PortfolioError> {
        let symbol = security.symbol().to_string();
        if self.securities.contains_key(&symbol) {
            return Err(PortfolioError::DuplicateSymbol(symbol));
        }
        self.securities.insert(symbol, security);
        Ok(())
    }

    /// Upsert by symbol.
    pub fn replace(&mut self, security: Arc<Security>) {
        self.securities
            .insert(security.symbol().to_string(), security);
    }

    pub fn find(&self, symbol: &str) -> Option<&Arc<Security>> {
        self.securities.get(symbol)
    }

    pub fn get(&self, symbol: &str) -> Result<&Arc<Security>, PortfolioError> {
        self.securities
            .get(symbol)
            .ok_or_else(|| PortfolioError::SymbolNotFound(symbol.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Security>)> {
        self.securities.iter()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &String> {
        self.securities.keys()
    }

    pub fn first_security(&self) -> Option<&Arc<Security>> {
        self.securities.values().next()
    }
}
