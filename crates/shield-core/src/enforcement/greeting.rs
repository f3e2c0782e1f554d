use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GreetingMethod {
    #[default]
    Basic,
    /// First name from the passwd GECOS field
    #[serde(alias = "getent")]
    Directory,
    Custom,
}

/// First line of every user email
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn greeting(&self, user: &str) -> String;
}

pub struct BasicGreeting;

#[async_trait]
impl NameResolver for BasicGreeting {
    async fn greeting(&self, user: &str) -> String {
        format!("Hello {user},")
    }
}

pub struct DirectoryGreeting {
    getent_path: PathBuf,
    timeout: Duration,
}

impl Default for DirectoryGreeting {
    fn default() -> Self {
        Self {
            getent_path: PathBuf::from("getent"),
            timeout: Duration::from_secs(5),
        }
    }
}

impl DirectoryGreeting {
    pub fn new(getent_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            getent_path: getent_path.into(),
            timeout,
        }
    }

    async fn lookup(&self, user: &str) -> Option<String> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.getent_path)
                .args(["passwd", user])
                .kill_on_drop(true)
                .output(),
        )
        .await
        .ok()?
        .ok()?;

        if !output.status.success() {
            debug!(user, "No passwd entry");
            return None;
        }
        first_name_from_passwd(&String::from_utf8_lossy(&output.stdout))
    }
}

/// First word of the GECOS field of a `passwd` line
pub(crate) fn first_name_from_passwd(line: &str) -> Option<String> {
    line.lines()
        .next()?
        .split(':')
        .nth(4)?
        .split([' ', ','])
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl NameResolver for DirectoryGreeting {
    async fn greeting(&self, user: &str) -> String {
        match self.lookup(user).await {
            Some(first) => format!("Hello {first} ({user}),"),
            None => format!("Hello {user},"),
        }
    }
}

/// Site-specific greeting; `{user}` is replaced with the username
pub struct CustomGreeting {
    template: String,
}

impl CustomGreeting {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl NameResolver for CustomGreeting {
    async fn greeting(&self, user: &str) -> String {
        self.template.replace("{user}", user)
    }
}

/// Pick the resolver once at startup
pub fn resolver_for(method: GreetingMethod, custom_template: Option<&str>) -> Box<dyn NameResolver> {
    match method {
        GreetingMethod::Basic => Box::new(BasicGreeting),
        GreetingMethod::Directory => Box::new(DirectoryGreeting::default()),
        GreetingMethod::Custom => match custom_template {
            Some(template) => Box::new(CustomGreeting::new(template)),
            None => {
                warn!("greeting_method is custom but custom_greeting is not set, using basic");
                Box::new(BasicGreeting)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_greeting() {
        assert_eq!(BasicGreeting.greeting("alice").await, "Hello alice,");
    }

    #[tokio::test]
    async fn test_custom_greeting() {
        let resolver = resolver_for(GreetingMethod::Custom, Some("Dear {user},"));
        assert_eq!(resolver.greeting("bob").await, "Dear bob,");

        let fallback = resolver_for(GreetingMethod::Custom, None);
        assert_eq!(fallback.greeting("bob").await, "Hello bob,");
    }

    #[test]
    fn test_first_name_from_passwd() {
        let line = "alice:x:1001:1001:Alice B. Smith,,,:/home/alice:/bin/bash\n";
        assert_eq!(first_name_from_passwd(line), Some("Alice".to_string()));
        assert_eq!(first_name_from_passwd("bob:x:1:1::/home/bob:/bin/sh"), None);
    }

    #[tokio::test]
    async fn test_directory_greeting_falls_back() {
        let resolver = DirectoryGreeting::new("/nonexistent/getent", Duration::from_secs(1));
        assert_eq!(resolver.greeting("carol").await, "Hello carol,");
    }
}
