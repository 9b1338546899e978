use std::collections::HashMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// A named (cpu, memory) shape advertised to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineClass {
    pub name: String,
    pub cpu: i64,
    pub memory_bytes: i64,
}

/// Read-only registry of machine classes, populated once at startup.
#[derive(Debug)]
pub struct MachineClassRegistry {
    classes: HashMap<String, MachineClass>,
}

impl MachineClassRegistry {
    pub fn new(classes: Vec<MachineClass>) -> Result<Self> {
        let mut registry = HashMap::new();
        for class in classes {
            if registry.contains_key(&class.name) {
                bail!("multiple machine classes with same name ({}) found", class.name);
            }
            registry.insert(class.name.clone(), class);
        }

        Ok(Self { classes: registry })
    }

    pub fn get(&self, name: &str) -> Option<&MachineClass> {
        self.classes.get(name)
    }

    pub fn list(&self) -> Vec<MachineClass> {
        self.classes.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str) -> MachineClass {
        MachineClass {
            name: name.to_string(),
            cpu: 2,
            memory_bytes: 2 << 30,
        }
    }

    #[test]
    fn test_get_and_list() {
        let registry = MachineClassRegistry::new(vec![class("small"), class("large")])
            .expect("failed to build registry");

        assert_eq!(registry.get("small").map(|c| c.cpu), Some(2));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = MachineClassRegistry::new(vec![class("small"), class("small")])
            .expect_err("expected duplicate error");
        assert!(err.to_string().contains("small"));
    }
}
