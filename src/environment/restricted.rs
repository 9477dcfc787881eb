//! Explicit environment for executed code.

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::RestrictedEnvConfig;

/// Proxy variables that are always present and always empty, so a proxy
/// configured on the host never reaches executed code.
const BLANKED_PROXY_VARS: [&str; 6] = [
    "http_proxy",
    "https_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "all_proxy",
    "ALL_PROXY",
];

/// Every variable a child process sees. The child environment is cleared and
/// rebuilt from this struct; nothing is inherited from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestrictedEnv {
    pub path: String,
    pub home: String,
    /// Always empty.
    pub pythonpath: String,
    pub project_root: String,
    pub lang: String,
    pub lc_all: String,
}

impl RestrictedEnv {
    pub fn new(project_path: &Path, config: &RestrictedEnvConfig) -> Self {
        let project = project_path.to_string_lossy().into_owned();
        Self {
            path: config.path.clone(),
            home: project.clone(),
            pythonpath: String::new(),
            project_root: project,
            lang: config.locale.clone(),
            lc_all: config.locale.clone(),
        }
    }

    /// The complete variable map handed to the spawn call.
    pub fn vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::from([
            ("PATH".to_string(), self.path.clone()),
            ("HOME".to_string(), self.home.clone()),
            ("PYTHONPATH".to_string(), self.pythonpath.clone()),
            ("PROJECT_ROOT".to_string(), self.project_root.clone()),
            ("LANG".to_string(), self.lang.clone()),
            ("LC_ALL".to_string(), self.lc_all.clone()),
        ]);
        for name in BLANKED_PROXY_VARS {
            vars.insert(name.to_string(), String::new());
        }
        vars
    }
}
