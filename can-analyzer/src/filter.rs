//! Session and catalog filter rules
//!
//! A session has at most one session-wide rule and one rule per loaded
//! catalog. A frame passes a path when it passes both the session rule and
//! the rule of the catalog it is routed to. Rules are stored in an immutable
//! table swapped atomically on every mutation, so the RX worker evaluates a
//! frame against one consistent rule set.

use crate::error::{AnalyzerError, Result};
use crate::events::{EventBus, EventKind};
use crate::shared::SwapCell;
use crate::signals::catalog::MessageDefinition;
use crate::types::{CatalogKey, Frame};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Include/exclude semantics of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Only targeted ids/signals pass
    Include,
    /// Everything except targeted ids/signals passes
    #[default]
    Exclude,
}

/// Which rule a mutation applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterScope {
    /// Applies to every frame of the session
    Session,
    /// Applies to frames routed to the named catalog
    Catalog(CatalogKey),
}

impl fmt::Display for FilterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterScope::Session => write!(f, "session filter"),
            FilterScope::Catalog(key) => write!(f, "filter of '{}'", key),
        }
    }
}

/// Processing path a rule is evaluated for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPath {
    /// Decode and store in the DataStore
    Plotting,
    /// Forward to the logging sink
    Logging,
}

/// Paths a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPaths {
    #[serde(default = "default_true")]
    pub plotting: bool,
    #[serde(default)]
    pub logging: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FilterPaths {
    fn default() -> Self {
        Self {
            plotting: true,
            logging: false,
        }
    }
}

impl FilterPaths {
    fn covers(&self, path: FilterPath) -> bool {
        match path {
            FilterPath::Plotting => self.plotting,
            FilterPath::Logging => self.logging,
        }
    }
}

/// Something a rule can target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterTarget {
    /// Arbitration id (standard and extended frames alike)
    Id(u32),
    /// Signal name
    Signal(String),
}

impl fmt::Display for FilterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterTarget::Id(id) => write!(f, "id 0x{:X}", id),
            FilterTarget::Signal(name) => write!(f, "signal '{}'", name),
        }
    }
}

/// One include/exclude rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: FilterMode,
    /// Targeted arbitration ids
    #[serde(default)]
    pub ids: BTreeSet<u32>,
    /// Targeted signal names
    #[serde(default)]
    pub signals: BTreeSet<String>,
    #[serde(default)]
    pub paths: FilterPaths,
}

impl Default for FilterRule {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: FilterMode::default(),
            ids: BTreeSet::new(),
            signals: BTreeSet::new(),
            paths: FilterPaths::default(),
        }
    }
}

impl FilterRule {
    /// Enabled rule with the given mode and no targets
    pub fn new(mode: FilterMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Builder method: target an id
    pub fn with_id(mut self, id: u32) -> Self {
        self.ids.insert(id);
        self
    }

    /// Builder method: target a signal
    pub fn with_signal(mut self, name: impl Into<String>) -> Self {
        self.signals.insert(name.into());
        self
    }

    /// Builder method: set the paths the rule applies to
    pub fn with_paths(mut self, paths: FilterPaths) -> Self {
        self.paths = paths;
        self
    }

    fn applies_to(&self, path: FilterPath) -> bool {
        self.enabled && self.paths.covers(path)
    }

    /// Id-level check
    fn passes_frame(&self, id: u32, message: Option<&MessageDefinition>) -> bool {
        let id_targeted = self.ids.contains(&id);
        match self.mode {
            FilterMode::Include => {
                id_targeted
                    || message.is_some_and(|m| {
                        m.signals.iter().any(|s| self.signals.contains(&s.name))
                    })
            }
            FilterMode::Exclude => !id_targeted,
        }
    }

    /// Signal-level check
    fn passes_signal(&self, id: u32, signal: &str) -> bool {
        let targeted = self.ids.contains(&id) || self.signals.contains(signal);
        match self.mode {
            FilterMode::Include => targeted,
            FilterMode::Exclude => !targeted,
        }
    }

    fn insert(&mut self, target: FilterTarget) -> bool {
        match target {
            FilterTarget::Id(id) => self.ids.insert(id),
            FilterTarget::Signal(name) => self.signals.insert(name),
        }
    }

    fn remove(&mut self, target: &FilterTarget) -> bool {
        match target {
            FilterTarget::Id(id) => self.ids.remove(id),
            FilterTarget::Signal(name) => self.signals.remove(name),
        }
    }
}

/// Immutable snapshot of a session's rules
#[derive(Debug, Clone, Default)]
pub struct FilterTable {
    session: Option<FilterRule>,
    catalogs: HashMap<CatalogKey, FilterRule>,
}

impl FilterTable {
    fn rules<'a>(
        &'a self,
        path: FilterPath,
        catalog: Option<&str>,
    ) -> impl Iterator<Item = &'a FilterRule> + 'a {
        let catalog_rule = catalog.and_then(|key| self.catalogs.get(key));
        self.session
            .iter()
            .chain(catalog_rule)
            .filter(move |rule| rule.applies_to(path))
    }

    /// Id-granularity evaluation
    ///
    /// `message` lets an INCLUDE rule pass a frame because one of its signals
    /// is targeted.
    pub fn evaluate(
        &self,
        path: FilterPath,
        frame: &Frame,
        catalog: Option<&str>,
        message: Option<&MessageDefinition>,
    ) -> bool {
        self.rules(path, catalog)
            .all(|rule| rule.passes_frame(frame.can_id, message))
    }

    /// Signal-granularity evaluation
    pub fn evaluate_signal(
        &self,
        path: FilterPath,
        frame: &Frame,
        catalog: Option<&str>,
        signal: &str,
    ) -> bool {
        self.rules(path, catalog)
            .all(|rule| rule.passes_signal(frame.can_id, signal))
    }

    /// Rule for a scope
    pub fn rule(&self, scope: &FilterScope) -> Option<&FilterRule> {
        match scope {
            FilterScope::Session => self.session.as_ref(),
            FilterScope::Catalog(key) => self.catalogs.get(key),
        }
    }

    fn rule_mut(&mut self, scope: &FilterScope) -> Option<&mut FilterRule> {
        match scope {
            FilterScope::Session => self.session.as_mut(),
            FilterScope::Catalog(key) => self.catalogs.get_mut(key),
        }
    }

    fn rule_or_default(&mut self, scope: &FilterScope) -> &mut FilterRule {
        match scope {
            FilterScope::Session => self.session.get_or_insert_with(FilterRule::default),
            FilterScope::Catalog(key) => self.catalogs.entry(key.clone()).or_default(),
        }
    }

    fn set(&mut self, scope: &FilterScope, rule: Option<FilterRule>) -> Option<FilterRule> {
        match (scope, rule) {
            (FilterScope::Session, rule) => std::mem::replace(&mut self.session, rule),
            (FilterScope::Catalog(key), Some(rule)) => self.catalogs.insert(key.clone(), rule),
            (FilterScope::Catalog(key), None) => self.catalogs.remove(key),
        }
    }
}

/// A session's filter rules
pub struct FilterSet {
    table: SwapCell<FilterTable>,
    events: EventBus,
}

impl FilterSet {
    /// Create an empty filter set (everything passes)
    pub fn new(events: EventBus) -> Self {
        Self {
            table: SwapCell::default(),
            events,
        }
    }

    /// Current rule snapshot
    pub fn snapshot(&self) -> Arc<FilterTable> {
        self.table.load()
    }

    /// See [`FilterTable::evaluate`]
    pub fn evaluate(
        &self,
        path: FilterPath,
        frame: &Frame,
        catalog: Option<&str>,
        message: Option<&MessageDefinition>,
    ) -> bool {
        self.snapshot().evaluate(path, frame, catalog, message)
    }

    /// See [`FilterTable::evaluate_signal`]
    pub fn evaluate_signal(
        &self,
        path: FilterPath,
        frame: &Frame,
        catalog: Option<&str>,
        signal: &str,
    ) -> bool {
        self.snapshot().evaluate_signal(path, frame, catalog, signal)
    }

    /// Replace the rule of a scope
    pub fn configure(&self, scope: FilterScope, rule: FilterRule) {
        log::debug!("Configured {}: {:?}", scope, rule);
        self.table.update(|table| {
            table.set(&scope, Some(rule));
        });
    }

    /// Add a target, creating a default (EXCLUDE, plotting only) rule if needed
    pub fn add(&self, scope: FilterScope, target: FilterTarget) {
        log::debug!("Adding {} to {}", target, scope);
        self.table.update(|table| {
            table.rule_or_default(&scope).insert(target);
        });
    }

    /// Remove a target
    pub fn remove(&self, scope: FilterScope, target: &FilterTarget) -> Result<()> {
        let result = self.table.try_update(|table| {
            let removed = table
                .rule_mut(&scope)
                .is_some_and(|rule| rule.remove(target));
            if removed {
                Ok(())
            } else {
                Err(AnalyzerError::NotFound(format!("{} in {}", target, scope)))
            }
        });
        self.report(result)
    }

    /// Change the mode of an existing rule
    pub fn set_mode(&self, scope: FilterScope, mode: FilterMode) -> Result<()> {
        self.modify(scope, |rule| rule.mode = mode)
    }

    /// Enable or disable an existing rule
    pub fn set_enabled(&self, scope: FilterScope, enabled: bool) -> Result<()> {
        self.modify(scope, |rule| rule.enabled = enabled)
    }

    /// Change the paths an existing rule applies to
    pub fn set_paths(&self, scope: FilterScope, paths: FilterPaths) -> Result<()> {
        self.modify(scope, |rule| rule.paths = paths)
    }

    /// Remove the rule of a scope entirely; returns the removed rule
    pub fn clear(&self, scope: FilterScope) -> Option<FilterRule> {
        self.table.update(|table| table.set(&scope, None))
    }

    /// Remove every rule
    pub fn clear_all(&self) {
        self.table.update(|table| *table = FilterTable::default());
    }

    /// Copy of the rule of a scope
    pub fn rule(&self, scope: &FilterScope) -> Option<FilterRule> {
        self.snapshot().rule(scope).cloned()
    }

    /// Drop the rule of an unloaded catalog
    pub fn drop_catalog(&self, key: &str) {
        self.clear(FilterScope::Catalog(key.to_string()));
    }

    fn modify(&self, scope: FilterScope, f: impl FnOnce(&mut FilterRule)) -> Result<()> {
        let result = self.table.try_update(|table| match table.rule_mut(&scope) {
            Some(rule) => {
                f(rule);
                Ok(())
            }
            None => Err(AnalyzerError::NotFound(scope.to_string())),
        });
        self.report(result)
    }

    fn report(&self, result: Result<()>) -> Result<()> {
        if let Err(AnalyzerError::NotFound(what)) = &result {
            self.events.emit(EventKind::NotFound { what: what.clone() });
        }
        result
    }
}

impl Default for FilterSet {
    fn default() -> Self {
        Self::new(EventBus::new("detached"))
    }
}
