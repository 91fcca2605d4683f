use std::collections::HashMap;

/// One execution profile: which image to run, where raw code lands inside the
/// workspace, and the default commands for builds and dependency installs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeProfile {
    pub image: &'static str,
    pub file_name: &'static str,
    pub default_build_cmd: &'static str,
    /// Template with a `{deps}` placeholder, empty if the runtime has no
    /// package manager step.
    pub install_template: &'static str,
}

impl RuntimeProfile {
    /// Render the dependency-install command for this profile, or `None` when
    /// there is nothing to install.
    pub fn install_command(&self, dependencies: &[String]) -> Option<String> {
        if self.install_template.is_empty() || dependencies.is_empty() {
            return None;
        }
        Some(
            self.install_template
                .replace("{deps}", &dependencies.join(" ")),
        )
    }
}

/// Static mapping from lowercase runtime tag to its profile. Read-only after
/// process start.
#[derive(Debug, Clone)]
pub struct RuntimeCatalog {
    profiles: HashMap<&'static str, RuntimeProfile>,
}

pub const DEFAULT_RUNTIME: &str = "nodejs";

impl Default for RuntimeCatalog {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(
            "nodejs",
            RuntimeProfile {
                image: "node:20-alpine",
                file_name: "index.js",
                default_build_cmd: "node index.js",
                install_template: "npm install {deps}",
            },
        );
        profiles.insert(
            "python",
            RuntimeProfile {
                image: "python:3.11-slim",
                file_name: "main.py",
                default_build_cmd: "python main.py",
                install_template: "pip install {deps}",
            },
        );
        profiles.insert(
            "bash",
            RuntimeProfile {
                image: "alpine:3.20",
                file_name: "run.sh",
                default_build_cmd: "sh run.sh",
                install_template: "",
            },
        );

        Self { profiles }
    }
}

impl RuntimeCatalog {
    pub fn supports(&self, tag: &str) -> bool {
        self.profiles.contains_key(tag.to_lowercase().as_str())
    }

    /// Look up a profile by tag; unknown tags resolve to the default entry.
    pub fn resolve(&self, tag: &str) -> &RuntimeProfile {
        self.profiles
            .get(tag.to_lowercase().as_str())
            .unwrap_or_else(|| &self.profiles[DEFAULT_RUNTIME])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_tags_resolve() {
        let catalog = RuntimeCatalog::default();
        assert_eq!(catalog.resolve("python").file_name, "main.py");
        assert_eq!(catalog.resolve("PYTHON").file_name, "main.py");
        assert_eq!(catalog.resolve("nodejs").image, "node:20-alpine");
        assert!(catalog.supports("bash"));
        assert!(!catalog.supports("cobol"));
    }

    #[test]
    fn test_unknown_tag_falls_back_to_default() {
        let catalog = RuntimeCatalog::default();
        assert_eq!(catalog.resolve("cobol"), catalog.resolve(DEFAULT_RUNTIME));
    }

    #[test]
    fn test_install_command_rendering() {
        let catalog = RuntimeCatalog::default();
        let deps = vec!["express".to_owned(), "lodash".to_owned()];
        assert_eq!(
            catalog.resolve("nodejs").install_command(&deps),
            Some("npm install express lodash".to_owned())
        );
        assert_eq!(catalog.resolve("nodejs").install_command(&[]), None);
        assert_eq!(catalog.resolve("bash").install_command(&deps), None);
    }
}
