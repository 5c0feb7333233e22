//! Directives that only change the image configuration.

use a3s_build_core::error::{BuildError, Result};

use super::{join_pairs, CacheState, Instruction};
use crate::args::BuildArgs;
use crate::image::ImageConfig;

fn substitute_pairs(
    pairs: &[(String, String)],
    config: &ImageConfig,
    args: &BuildArgs,
) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|(k, v)| {
            Ok((
                args.substitute(k, &config.env)?,
                args.substitute(v, &config.env)?,
            ))
        })
        .collect()
}

/// `ENV`
pub struct EnvCommand {
    pairs: Vec<(String, String)>,
    cache: CacheState,
}

impl EnvCommand {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self {
            pairs,
            cache: CacheState::new(),
        }
    }
}

impl Instruction for EnvCommand {
    fn execute(&mut self, config: &mut ImageConfig, args: &mut BuildArgs) -> Result<()> {
        // All values see the environment as it was before this instruction.
        let resolved = substitute_pairs(&self.pairs, config, args)?;
        for (key, value) in resolved {
            config.set_env(&key, &value);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("ENV {}", join_pairs(&self.pairs))
    }

    fn resolved_text(&self, config: &ImageConfig, args: &BuildArgs) -> Result<String> {
        Ok(format!(
            "ENV {}",
            join_pairs(&substitute_pairs(&self.pairs, config, args)?)
        ))
    }

    cache_state_accessors!();
}

/// `LABEL`
pub struct LabelCommand {
    pairs: Vec<(String, String)>,
    cache: CacheState,
}

impl LabelCommand {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self {
            pairs,
            cache: CacheState::new(),
        }
    }
}

impl Instruction for LabelCommand {
    fn execute(&mut self, config: &mut ImageConfig, args: &mut BuildArgs) -> Result<()> {
        for (key, value) in substitute_pairs(&self.pairs, config, args)? {
            config.set_label(&key, &value);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("LABEL {}", join_pairs(&self.pairs))
    }

    fn resolved_text(&self, config: &ImageConfig, args: &BuildArgs) -> Result<String> {
        Ok(format!(
            "LABEL {}",
            join_pairs(&substitute_pairs(&self.pairs, config, args)?)
        ))
    }

    cache_state_accessors!();
}

/// `CMD`
pub struct CmdCommand {
    exec: Vec<String>,
    cache: CacheState,
}

impl CmdCommand {
    pub fn new(exec: Vec<String>) -> Self {
        Self {
            exec,
            cache: CacheState::new(),
        }
    }
}

impl Instruction for CmdCommand {
    fn execute(&mut self, config: &mut ImageConfig, _args: &mut BuildArgs) -> Result<()> {
        config.cmd = Some(self.exec.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("CMD {:?}", self.exec)
    }

    cache_state_accessors!();
}

/// `ENTRYPOINT`
pub struct EntrypointCommand {
    exec: Vec<String>,
    cache: CacheState,
}

impl EntrypointCommand {
    pub fn new(exec: Vec<String>) -> Self {
        Self {
            exec,
            cache: CacheState::new(),
        }
    }
}

impl Instruction for EntrypointCommand {
    fn execute(&mut self, config: &mut ImageConfig, _args: &mut BuildArgs) -> Result<()> {
        config.entrypoint = Some(self.exec.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("ENTRYPOINT {:?}", self.exec)
    }

    cache_state_accessors!();
}

/// `USER`
pub struct UserCommand {
    user: String,
    cache: CacheState,
}

impl UserCommand {
    pub fn new(user: String) -> Self {
        Self {
            user,
            cache: CacheState::new(),
        }
    }
}

impl Instruction for UserCommand {
    fn execute(&mut self, config: &mut ImageConfig, args: &mut BuildArgs) -> Result<()> {
        let user = args.substitute(&self.user, &config.env)?;
        if user.is_empty() || user.starts_with(':') {
            return Err(BuildError::Config(format!("invalid USER value '{}'", user)));
        }
        config.user = Some(user);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("USER {}", self.user)
    }

    fn resolved_text(&self, config: &ImageConfig, args: &BuildArgs) -> Result<String> {
        Ok(format!("USER {}", args.substitute(&self.user, &config.env)?))
    }

    cache_state_accessors!();
}

/// `EXPOSE`
pub struct ExposeCommand {
    ports: Vec<String>,
    cache: CacheState,
}

impl ExposeCommand {
    pub fn new(ports: Vec<String>) -> Self {
        Self {
            ports,
            cache: CacheState::new(),
        }
    }
}

/// Normalize `80` to `80/tcp`, rejecting unknown protocols.
fn normalize_port(port: &str) -> Result<String> {
    let (number, protocol) = match port.split_once('/') {
        Some((n, p)) => (n, p.to_ascii_lowercase()),
        None => (port, "tcp".to_string()),
    };
    if !matches!(protocol.as_str(), "tcp" | "udp" | "sctp") {
        return Err(BuildError::Config(format!(
            "invalid protocol '{}' in EXPOSE {}",
            protocol, port
        )));
    }
    let valid = match number.split_once('-') {
        Some((lo, hi)) => lo.parse::<u16>().is_ok() && hi.parse::<u16>().is_ok(),
        None => number.parse::<u16>().is_ok(),
    };
    if !valid {
        return Err(BuildError::Config(format!("invalid port '{}' in EXPOSE", port)));
    }
    Ok(format!("{}/{}", number, protocol))
}

impl Instruction for ExposeCommand {
    fn execute(&mut self, config: &mut ImageConfig, args: &mut BuildArgs) -> Result<()> {
        for port in &self.ports {
            let port = normalize_port(&args.substitute(port, &config.env)?)?;
            if !config.exposed_ports.contains(&port) {
                config.exposed_ports.push(port);
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("EXPOSE {}", self.ports.join(" "))
    }

    cache_state_accessors!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_replaces_and_appends() {
        let mut config = ImageConfig {
            env: vec!["PATH=/bin".to_string(), "A=old".to_string()],
            ..Default::default()
        };
        let mut cmd = EnvCommand::new(pairs(&[("A", "new"), ("B", "$A-x")]));
        cmd.execute(&mut config, &mut BuildArgs::new()).unwrap();
        assert_eq!(config.env, vec!["PATH=/bin", "A=new", "B=old-x"]);
        assert!(cmd.is_metadata_only());
        assert!(cmd.files_to_snapshot().is_empty());
    }

    #[test]
    fn test_env_with_build_arg() {
        let mut config = ImageConfig::default();
        let mut args = BuildArgs::new();
        args.declare("VERSION", Some("1.2".to_string())).unwrap();
        let mut cmd = EnvCommand::new(pairs(&[("APP_VERSION", "${VERSION}")]));
        assert_eq!(
            cmd.resolved_text(&config, &args).unwrap(),
            "ENV APP_VERSION=1.2"
        );
        cmd.execute(&mut config, &mut args).unwrap();
        assert_eq!(config.env, vec!["APP_VERSION=1.2"]);
    }

    #[test]
    fn test_env_undeclared_fails_without_change() {
        let mut config = ImageConfig::default();
        let mut cmd = EnvCommand::new(pairs(&[("A", "1"), ("B", "$MISSING")]));
        assert!(cmd.execute(&mut config, &mut BuildArgs::new()).is_err());
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_cmd_and_entrypoint() {
        let mut config = ImageConfig::default();
        let mut args = BuildArgs::new();
        CmdCommand::new(vec!["nginx".to_string(), "-g".to_string()])
            .execute(&mut config, &mut args)
            .unwrap();
        EntrypointCommand::new(vec!["/entry.sh".to_string()])
            .execute(&mut config, &mut args)
            .unwrap();
        assert_eq!(config.cmd, Some(vec!["nginx".to_string(), "-g".to_string()]));
        assert_eq!(config.entrypoint, Some(vec!["/entry.sh".to_string()]));
    }

    #[test]
    fn test_user() {
        let mut config = ImageConfig::default();
        UserCommand::new("app:staff".to_string())
            .execute(&mut config, &mut BuildArgs::new())
            .unwrap();
        assert_eq!(config.user.as_deref(), Some("app:staff"));

        assert!(UserCommand::new(String::new())
            .execute(&mut config, &mut BuildArgs::new())
            .is_err());
    }

    #[test]
    fn test_label() {
        let mut config = ImageConfig::default();
        let mut cmd = LabelCommand::new(pairs(&[("version", "1"), ("maintainer", "a3s")]));
        cmd.execute(&mut config, &mut BuildArgs::new()).unwrap();
        let mut cmd = LabelCommand::new(pairs(&[("version", "2")]));
        cmd.execute(&mut config, &mut BuildArgs::new()).unwrap();
        assert_eq!(config.labels, pairs(&[("version", "2"), ("maintainer", "a3s")]));
    }

    #[test]
    fn test_expose() {
        let mut config = ImageConfig::default();
        let mut cmd = ExposeCommand::new(vec![
            "80".to_string(),
            "53/UDP".to_string(),
            "80/tcp".to_string(),
            "8000-8010".to_string(),
        ]);
        cmd.execute(&mut config, &mut BuildArgs::new()).unwrap();
        assert_eq!(
            config.exposed_ports,
            vec!["80/tcp", "53/udp", "8000-8010/tcp"]
        );

        let mut bad = ExposeCommand::new(vec!["80/http".to_string()]);
        assert!(bad.execute(&mut config, &mut BuildArgs::new()).is_err());
        let mut bad = ExposeCommand::new(vec!["http".to_string()]);
        assert!(bad.execute(&mut config, &mut BuildArgs::new()).is_err());
    }
}
