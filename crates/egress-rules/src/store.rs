use crate::RuleTables;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Source of the outbound pattern and rule tables.
/// `RuleMatcher` calls `load` at startup and whenever its
/// refresh interval elapses.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<RuleTables>;
}

/// Tables held in memory, typically parsed from the config file
#[derive(Default)]
pub struct StaticRuleStore {
    tables: Mutex<RuleTables>,
}

impl StaticRuleStore {
    pub fn new(tables: RuleTables) -> Self {
        Self {
            tables: Mutex::new(tables),
        }
    }

    /// Swap in new tables; they take effect on the next reload
    pub fn replace(&self, tables: RuleTables) {
        *self.tables.lock() = tables;
    }
}

#[async_trait]
impl RuleStore for StaticRuleStore {
    async fn load(&self) -> anyhow::Result<RuleTables> {
        Ok(self.tables.lock().clone())
    }
}
