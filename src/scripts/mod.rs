//! Probe bundles per kernel language.
//!
//! A bundle's commands are substituted into the kernel's execution stream:
//! `query_command` prints the variable listing as a JSON array,
//! `matrix_query_command(name, rows)` prints a JSON table description and
//! `delete_command('name')` removes a variable from the kernel namespace.

use std::{collections::HashMap, sync::OnceLock};

use serde::{Deserialize, Serialize};

use crate::error::{InspectorError, Result};

const PYTHON_INIT: &str = include_str!("python.py");
const R_INIT: &str = include_str!("r.R");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeBundle {
    pub init_script: String,
    pub query_command: String,
    pub matrix_query_command: String,
    pub delete_command: String,
}

impl ProbeBundle {
    pub fn matrix_query(&self, name: &str, max_rows: usize) -> String {
        format!("{}({}, {})", self.matrix_query_command, name, max_rows)
    }

    pub fn delete(&self, name: &str) -> String {
        format!("{}('{}')", self.delete_command, name)
    }

    /// Whether submitted code is one of this bundle's own queries. Exact
    /// match only: a parameterised matrix query is not recognised.
    pub fn is_own_query(&self, code: &str) -> bool {
        code == self.query_command || code == self.matrix_query_command
    }

    fn python() -> Self {
        Self {
            init_script: PYTHON_INIT.to_string(),
            query_command: "_varinspect_dict_list()".into(),
            matrix_query_command: "_varinspect_getmatrixcontent".into(),
            delete_command: "_varinspect_deletevariable".into(),
        }
    }

    fn r() -> Self {
        Self {
            init_script: R_INIT.to_string(),
            query_command: ".ls.objects()".into(),
            matrix_query_command: ".ls.objects".into(),
            delete_command: ".deleteVariable".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptRegistry {
    bundles: HashMap<String, ProbeBundle>,
}

impl ScriptRegistry {
    /// The process-wide registry of built-in bundles.
    pub fn builtin() -> &'static ScriptRegistry {
        static REGISTRY: OnceLock<ScriptRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            let mut bundles = HashMap::new();
            let python = ProbeBundle::python();
            for lang in ["python3", "python2", "python"] {
                bundles.insert(lang.to_string(), python.clone());
            }
            bundles.insert("R".to_string(), ProbeBundle::r());
            ScriptRegistry { bundles }
        })
    }

    pub fn lookup(&self, language: &str) -> Result<&ProbeBundle> {
        self.bundles
            .get(language)
            .ok_or_else(|| InspectorError::UnsupportedLanguage(language.to_string()))
    }

    pub fn supported_languages(&self) -> Vec<&str> {
        let mut langs: Vec<&str> = self.bundles.keys().map(String::as_str).collect();
        langs.sort_unstable();
        langs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_supported_bundle_is_complete() {
        let registry = ScriptRegistry::builtin();
        for lang in registry.supported_languages() {
            let bundle = registry.lookup(lang).unwrap();
            assert!(!bundle.init_script.trim().is_empty(), "{lang}");
            assert!(!bundle.query_command.is_empty(), "{lang}");
            assert!(!bundle.matrix_query_command.is_empty(), "{lang}");
            assert!(!bundle.delete_command.is_empty(), "{lang}");
        }
        assert_eq!(registry.supported_languages(), vec!["R", "python", "python2", "python3"]);
    }

    #[test]
    fn unknown_language_is_rejected() {
        for lang in ["julia", "", "Python", "r"] {
            assert_eq!(
                ScriptRegistry::builtin().lookup(lang),
                Err(InspectorError::UnsupportedLanguage(lang.to_string()))
            );
        }
    }

    #[test]
    fn command_formatting() {
        let bundle = ScriptRegistry::builtin().lookup("python").unwrap();
        assert_eq!(bundle.matrix_query("df", 500), "_varinspect_getmatrixcontent(df, 500)");
        assert_eq!(bundle.delete("df"), "_varinspect_deletevariable('df')");
    }

    #[test]
    fn own_query_matching_is_exact() {
        let bundle = ScriptRegistry::builtin().lookup("R").unwrap();
        assert!(bundle.is_own_query(".ls.objects()"));
        assert!(bundle.is_own_query(".ls.objects"));
        assert!(!bundle.is_own_query(".ls.objects(df, 10)"));
        assert!(!bundle.is_own_query("x <- 1"));
    }

    #[test]
    fn init_scripts_define_their_commands() {
        let py = ScriptRegistry::builtin().lookup("python3").unwrap();
        assert!(py.init_script.contains("def _varinspect_dict_list"));
        assert!(py.init_script.contains("def _varinspect_getmatrixcontent"));
        assert!(py.init_script.contains("def _varinspect_deletevariable"));

        let r = ScriptRegistry::builtin().lookup("R").unwrap();
        assert!(r.init_script.contains(".deleteVariable <- function"));
    }

    #[test]
    fn r_listing_prints_sizes_as_text() {
        let r = ScriptRegistry::builtin().lookup("R").unwrap();
        assert!(r.init_script.contains(".ls.objects <- function(pos = 1) {"));
        assert!(r.init_script.contains("out$varSize <- as.character(out$varSize)"));
        assert!(r.init_script.contains("out$isMatrix <- FALSE"));
    }
}
