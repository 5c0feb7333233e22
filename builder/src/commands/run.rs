//! `RUN`: execute a shell command against the root filesystem.
//!
//! On a cache hit the recorded layer is replayed instead and no process is
//! spawned. Filesystem effects of a real run are picked up afterwards by the
//! snapshotter.

use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use a3s_build_core::error::{BuildError, Result};
use nix::unistd::{self, Gid, Uid};

use super::user::{add_default_home, resolve_ids, UserLookup};
use super::{host_path, CacheState, Instruction};
use crate::archive::Materializer;
use crate::args::{env_value, BuildArgs};
use crate::image::ImageConfig;

pub struct RunCommand {
    command: String,
    root: PathBuf,
    materializer: Materializer,
    users: Arc<dyn UserLookup>,
    cache: CacheState,
    snapshot_files: Vec<PathBuf>,
}

impl RunCommand {
    pub fn new(
        command: String,
        root: &Path,
        materializer: Materializer,
        users: Arc<dyn UserLookup>,
    ) -> Self {
        Self {
            command,
            root: root.to_path_buf(),
            materializer,
            users,
            cache: CacheState::new(),
            snapshot_files: Vec::new(),
        }
    }

    /// Environment for the child: image env, unshadowed build args, HOME.
    fn command_env(&self, config: &ImageConfig, args: &BuildArgs) -> Vec<String> {
        let mut env = config.env.clone();
        for (name, value) in args.resolved() {
            if env_value(&name, &config.env).is_none() {
                env.push(format!("{}={}", name, value));
            }
        }
        add_default_home(config.user.as_deref(), env, self.users.as_ref())
    }

    fn is_host_root(&self) -> bool {
        self.root == Path::new("/")
    }

    fn spawn(&self, config: &ImageConfig, env: &[String]) -> Result<()> {
        let workdir = config.working_dir().to_string();
        let host_workdir = host_path(&self.root, &workdir);
        std::fs::create_dir_all(&host_workdir).map_err(|e| {
            BuildError::Io(io::Error::new(
                e.kind(),
                format!(
                    "Failed to create working directory {}: {}",
                    host_workdir.display(),
                    e
                ),
            ))
        })?;

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(&self.command);
        cmd.env_clear();
        for entry in env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }

        let ids = match config.user.as_deref() {
            Some(user) if !user.is_empty() => Some(resolve_ids(user, self.users.as_ref())?),
            _ => None,
        };

        if self.is_host_root() {
            if let Some((uid, gid)) = ids {
                cmd.uid(uid).gid(gid);
            }
            cmd.current_dir(&workdir);
        } else {
            let root = self.root.clone();
            let dir = PathBuf::from(&workdir);
            // Credentials are dropped only after chroot(2), which needs them.
            // SAFETY: the hook runs between fork and exec and only issues
            // async-signal-safe syscalls.
            unsafe {
                cmd.pre_exec(move || enter_root(&root, &dir, ids));
            }
        }

        tracing::debug!(
            command = %self.command,
            root = %self.root.display(),
            workdir = %workdir,
            "Spawning RUN command"
        );

        let status = cmd.status().map_err(|e| {
            BuildError::Io(io::Error::new(
                e.kind(),
                format!("Failed to execute RUN command: {}", e),
            ))
        })?;

        if !status.success() {
            return Err(BuildError::Command {
                command: self.command.clone(),
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

/// Confine the child to `root`, enter `dir`, then switch to `ids`.
fn enter_root(root: &Path, dir: &Path, ids: Option<(u32, u32)>) -> io::Result<()> {
    unistd::chroot(root)?;
    unistd::chdir(dir)?;
    if let Some((uid, gid)) = ids {
        let gid = Gid::from_raw(gid);
        if unistd::geteuid().is_root() {
            unistd::setgroups(&[gid])?;
        }
        unistd::setgid(gid)?;
        unistd::setuid(Uid::from_raw(uid))?;
    }
    Ok(())
}

impl Instruction for RunCommand {
    fn execute(&mut self, config: &mut ImageConfig, args: &mut BuildArgs) -> Result<()> {
        if self.cache.is_cached() {
            let files = self.cache.replay(&self.materializer, &self.root)?;
            self.snapshot_files = files.into_vec();
            return Ok(());
        }

        self.snapshot_files.clear();
        let env = self.command_env(config, args);
        self.spawn(config, &env)
    }

    fn describe(&self) -> String {
        format!("RUN {}", self.command)
    }

    /// Only a replayed layer has a known file list; a real run is diffed
    /// over the whole tree.
    fn files_to_snapshot(&self) -> Vec<PathBuf> {
        self.snapshot_files.clone()
    }

    fn resolved_text(&self, config: &ImageConfig, args: &BuildArgs) -> Result<String> {
        let mut text = self.describe();
        for (name, value) in args.resolved() {
            if env_value(&name, &config.env).is_none() {
                text.push_str(&format!(" |{}={}", name, value));
            }
        }
        Ok(text)
    }

    fn is_metadata_only(&self) -> bool {
        false
    }

    fn requires_unpacked_fs(&self) -> bool {
        true
    }

    cache_state_accessors!();
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{image_with_layers, tar_bytes};
    use super::super::user::{RootUsers, SystemUsers, UserInfo};
    use super::*;
    use crate::archive::EntryMeta;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct NoUsers;

    impl UserLookup for NoUsers {
        fn lookup(&self, _name: &str) -> Result<Option<UserInfo>> {
            Ok(None)
        }
    }

    fn run_cmd(command: &str, root: &Path) -> RunCommand {
        RunCommand::new(
            command.to_string(),
            root,
            Materializer::new(),
            Arc::new(SystemUsers),
        )
    }

    fn host_run(command: &str) -> RunCommand {
        run_cmd(command, Path::new("/"))
    }

    #[test]
    fn test_cached_run_counts_entries() {
        let root = TempDir::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let hook = Arc::clone(&counter);
        let mut cmd = RunCommand::new(
            "exit 1".to_string(),
            root.path(),
            Materializer::with_extract_fn(Arc::new(
                move |_: &Path, _: &EntryMeta, _: &mut dyn Read| -> Result<()> {
                    hook.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )),
            Arc::new(NoUsers),
        );
        cmd.mark_cached(true);
        cmd.attach_image(image_with_layers(vec![tar_bytes(&[("foo.txt", "Meow meow")])]));

        cmd.execute(&mut ImageConfig::default(), &mut BuildArgs::new())
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(cmd.layer().is_some());
        assert!(cmd.read_success());
    }

    #[test]
    fn test_cached_run_failures() {
        let root = TempDir::new().unwrap();

        let mut no_image = run_cmd("true", root.path());
        no_image.mark_cached(true);
        assert!(no_image
            .execute(&mut ImageConfig::default(), &mut BuildArgs::new())
            .is_err());
        assert!(!no_image.read_success());

        let mut no_layers = run_cmd("true", root.path());
        no_layers.mark_cached(true);
        no_layers.attach_image(image_with_layers(Vec::new()));
        let err = no_layers
            .execute(&mut ImageConfig::default(), &mut BuildArgs::new())
            .unwrap_err();
        assert!(matches!(err, BuildError::CacheIntegrity(_)));
        assert!(no_layers.layer().is_none());
    }

    #[test]
    fn test_cached_run_empty_layer() {
        let root = TempDir::new().unwrap();
        let mut cmd = run_cmd("exit 1", root.path());
        cmd.mark_cached(true);
        cmd.attach_image(image_with_layers(vec![Vec::new()]));

        cmd.execute(&mut ImageConfig::default(), &mut BuildArgs::new())
            .unwrap();
        assert!(cmd.layer().is_some());
        assert!(cmd.read_success());
    }

    #[test]
    fn test_run_on_host_root() {
        let out = TempDir::new().unwrap();
        let target = out.path().join("out.txt");
        let mut cmd = host_run(&format!("echo \"$GREETING:$HOME\" > {}", target.display()));
        let mut config = ImageConfig {
            env: vec!["GREETING=hello".to_string()],
            ..Default::default()
        };

        cmd.execute(&mut config, &mut BuildArgs::new()).unwrap();
        assert_eq!(
            std::fs::read_to_string(&target).unwrap().trim(),
            "hello:/root"
        );
        assert!(cmd.files_to_snapshot().is_empty());
        assert!(!cmd.read_success());
    }

    #[test]
    fn test_run_sees_build_args_and_workdir() {
        let out = TempDir::new().unwrap();
        let mut cmd = host_run("echo \"$VERSION\" > version.txt");
        let mut config = ImageConfig {
            working_dir: out.path().display().to_string(),
            ..Default::default()
        };
        let mut args = BuildArgs::new();
        args.declare("VERSION", Some("3.19".to_string())).unwrap();

        cmd.execute(&mut config, &mut args).unwrap();
        assert_eq!(
            std::fs::read_to_string(out.path().join("version.txt"))
                .unwrap()
                .trim(),
            "3.19"
        );
    }

    #[test]
    fn test_run_nonzero_exit() {
        let mut cmd = host_run("exit 3");
        let err = cmd
            .execute(&mut ImageConfig::default(), &mut BuildArgs::new())
            .unwrap_err();
        match err {
            BuildError::Command { command, code } => {
                assert_eq!(command, "exit 3");
                assert_eq!(code, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_run_as_current_uid() {
        let out = TempDir::new().unwrap();
        let target = out.path().join("id.txt");
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        let mut cmd = host_run(&format!("id -u > {}", target.display()));
        let mut config = ImageConfig {
            user: Some(format!("{}:{}", uid, gid)),
            env: vec!["PATH=/usr/bin:/bin".to_string()],
            ..Default::default()
        };

        cmd.execute(&mut config, &mut BuildArgs::new()).unwrap();
        assert_eq!(
            std::fs::read_to_string(&target).unwrap().trim(),
            uid.to_string()
        );
    }

    #[test]
    fn test_chrooted_run_with_user() {
        // chroot(2) needs CAP_SYS_CHROOT
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        let root = TempDir::new().unwrap();
        let mut cmd = RunCommand::new(
            "true".to_string(),
            root.path(),
            Materializer::new(),
            Arc::new(RootUsers::new(root.path())),
        );
        let mut config = ImageConfig {
            user: Some("65534:65534".to_string()),
            ..Default::default()
        };

        // The root has no shell: reaching exec means chroot and the
        // credential switch both succeeded.
        let err = cmd
            .execute(&mut config, &mut BuildArgs::new())
            .unwrap_err();
        match err {
            BuildError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::NotFound, "{}", e),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_command_env_uses_root_accounts() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("etc")).unwrap();
        std::fs::write(
            root.path().join("etc/passwd"),
            "app:x:1001:1001::/home/app-data:/bin/sh\n",
        )
        .unwrap();
        let cmd = RunCommand::new(
            "true".to_string(),
            root.path(),
            Materializer::new(),
            Arc::new(RootUsers::new(root.path())),
        );
        let config = ImageConfig {
            user: Some("app".to_string()),
            ..Default::default()
        };
        assert_eq!(
            cmd.command_env(&config, &BuildArgs::new()),
            vec!["HOME=/home/app-data"]
        );
    }

    #[test]
    fn test_resolved_text_includes_args() {
        let cmd = host_run("make");
        let mut args = BuildArgs::new();
        args.declare("V", Some("1".to_string())).unwrap();
        let text = cmd.resolved_text(&ImageConfig::default(), &args).unwrap();
        assert_eq!(text, "RUN make |V=1");

        let shadowed = ImageConfig {
            env: vec!["V=2".to_string()],
            ..Default::default()
        };
        assert_eq!(cmd.resolved_text(&shadowed, &args).unwrap(), "RUN make");
    }

    #[test]
    fn test_command_env_shadowing_and_home() {
        let cmd = RunCommand::new(
            "true".to_string(),
            Path::new("/"),
            Materializer::new(),
            Arc::new(NoUsers),
        );
        let config = ImageConfig {
            env: vec!["PATH=/x".to_string(), "A=env".to_string()],
            ..Default::default()
        };
        let mut args = BuildArgs::new();
        args.declare("A", Some("arg".to_string())).unwrap();
        args.declare("B", Some("arg".to_string())).unwrap();

        assert_eq!(
            cmd.command_env(&config, &args),
            vec!["PATH=/x", "A=env", "B=arg", "HOME=/root"]
        );
    }
}
