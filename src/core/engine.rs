/// Database engines and their dump/restore command plans
///
/// Each engine knows how to name its artifacts and how to turn a target plus an
/// execution mode into the external commands to run. Direct mode invokes the host
/// client against `host:port`; container mode runs the client inside the referenced
/// container through `docker exec`, connecting over loopback.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::process::CommandSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    MariaDb,
    PostgreSql,
    MongoDb,
}

impl EngineKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "mariadb" => Some(EngineKind::MariaDb),
            "postgresql" => Some(EngineKind::PostgreSql),
            "mongodb" => Some(EngineKind::MongoDb),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::MariaDb => "mariadb",
            EngineKind::PostgreSql => "postgresql",
            EngineKind::MongoDb => "mongodb",
        }
    }

    /// File extension of single-file artifacts; `None` for directory dumps
    pub fn artifact_extension(&self) -> Option<&'static str> {
        match self {
            EngineKind::MariaDb => Some("sql"),
            EngineKind::PostgreSql => Some("dump"),
            EngineKind::MongoDb => None,
        }
    }

    pub fn artifact_name(&self, database: &str, timestamp: &str) -> String {
        match self.artifact_extension() {
            Some(ext) => format!("{}_{}.{}", database, timestamp, ext),
            None => format!("{}_{}", database, timestamp),
        }
    }

    pub fn produces_directory(&self) -> bool {
        self.artifact_extension().is_none()
    }

    /// Commands producing `artifact` for `target`
    pub fn dump_plan(&self, target: &DatabaseTarget, artifact: &Path) -> CommandPlan {
        match self {
            EngineKind::MariaDb => mariadb::dump(target, artifact),
            EngineKind::PostgreSql => postgresql::dump(target, artifact),
            EngineKind::MongoDb => mongodb::dump(target, artifact),
        }
    }

    /// Commands loading `source` into the target database
    pub fn restore_plan(&self, target: &DatabaseTarget, source: &Path) -> CommandPlan {
        match self {
            EngineKind::MariaDb => mariadb::restore(target, source),
            EngineKind::PostgreSql => postgresql::restore(target, source),
            EngineKind::MongoDb => mongodb::restore(target, source),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Host-installed client connecting to `host:port`
    Direct,
    /// Client executed inside the named container
    Container(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseTarget {
    pub name: String,
    pub engine: EngineKind,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
    pub backup_path: PathBuf,
    /// Restarted after a restore and after a batch backup; independent of `mode`
    pub container: Option<String>,
    pub mode: ExecutionMode,
    pub max_backups: usize,
}

impl DatabaseTarget {
    fn password_or_empty(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }

    fn user_or(&self, default: &'static str) -> String {
        self.user.clone().unwrap_or_else(|| default.to_string())
    }
}

/// Ordered commands for one operation. `cleanup` runs after `steps` whatever
/// their outcome and its failures are only logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub steps: Vec<CommandSpec>,
    pub cleanup: Vec<CommandSpec>,
}

impl CommandPlan {
    pub fn single(step: CommandSpec) -> Self {
        Self {
            steps: vec![step],
            cleanup: Vec::new(),
        }
    }
}

/// `docker exec -i [-e VAR] <container>` prefix for in-container clients
fn docker_exec(container: &str, forwarded_env: Option<&str>) -> CommandSpec {
    let mut spec = CommandSpec::new("docker").args(["exec", "-i"]);
    if let Some(var) = forwarded_env {
        spec = spec.args(["-e", var]);
    }
    spec.arg(container)
}

mod mariadb {
    use super::*;

    const FLAGS: [&str; 3] = ["--single-transaction", "--routines", "--triggers"];

    pub(super) fn dump(target: &DatabaseTarget, artifact: &Path) -> CommandPlan {
        let user = target.user_or("root");
        let spec = match &target.mode {
            ExecutionMode::Direct => CommandSpec::new("mysqldump")
                .arg(format!("--host={}", target.host))
                .arg(format!("--port={}", target.port))
                .arg(format!("--user={}", user))
                .args(FLAGS)
                .arg(&target.database)
                .env("MYSQL_PWD", target.password_or_empty()),
            ExecutionMode::Container(container) => docker_exec(container, None)
                .arg("mariadb-dump")
                .args(["-h", "localhost", "-P"])
                .arg(target.port.to_string())
                .arg("-u")
                .arg(user)
                .secret_arg(format!("-p{}", target.password_or_empty()))
                .args(FLAGS)
                .arg(&target.database),
        };
        CommandPlan::single(spec.stdout_to(artifact))
    }

    pub(super) fn restore(target: &DatabaseTarget, source: &Path) -> CommandPlan {
        let user = target.user_or("root");
        let spec = match &target.mode {
            ExecutionMode::Direct => CommandSpec::new("mysql")
                .arg(format!("--host={}", target.host))
                .arg(format!("--port={}", target.port))
                .arg(format!("--user={}", user))
                .arg(&target.database)
                .env("MYSQL_PWD", target.password_or_empty()),
            ExecutionMode::Container(container) => docker_exec(container, None)
                .arg("mariadb")
                .args(["-h", "localhost", "-P"])
                .arg(target.port.to_string())
                .arg("-u")
                .arg(user)
                .secret_arg(format!("-p{}", target.password_or_empty()))
                .arg(&target.database),
        };
        CommandPlan::single(spec.stdin_from(source))
    }
}

mod postgresql {
    use super::*;

    pub(super) fn dump(target: &DatabaseTarget, artifact: &Path) -> CommandPlan {
        let user = target.user_or("postgres");
        let spec = match &target.mode {
            ExecutionMode::Direct => CommandSpec::new("pg_dump")
                .args(["-h", target.host.as_str(), "-p"])
                .arg(target.port.to_string())
                .args(["-U", user.as_str(), "-F", "c", "-b", "-v", "-f"])
                .arg(artifact.display().to_string())
                .arg(&target.database),
            ExecutionMode::Container(container) => docker_exec(container, Some("PGPASSWORD"))
                .arg("pg_dump")
                .args(["-h", "localhost", "-p"])
                .arg(target.port.to_string())
                .args(["-U", user.as_str(), "-F", "c", "-b", "-v"])
                .arg(&target.database)
                .stdout_to(artifact),
        };
        CommandPlan::single(spec.env("PGPASSWORD", target.password_or_empty()))
    }

    pub(super) fn restore(target: &DatabaseTarget, source: &Path) -> CommandPlan {
        let user = target.user_or("postgres");
        let spec = match &target.mode {
            ExecutionMode::Direct => CommandSpec::new("pg_restore")
                .args(["-h", target.host.as_str(), "-p"])
                .arg(target.port.to_string())
                .args(["-U", user.as_str(), "-d", target.database.as_str()])
                .args(["--clean", "--if-exists", "-v"])
                .arg(source.display().to_string()),
            ExecutionMode::Container(container) => docker_exec(container, Some("PGPASSWORD"))
                .arg("pg_restore")
                .args(["-h", "localhost", "-p"])
                .arg(target.port.to_string())
                .args(["-U", user.as_str(), "-d", target.database.as_str()])
                .args(["--clean", "--if-exists", "-v"])
                .stdin_from(source),
        };
        CommandPlan::single(spec.env("PGPASSWORD", target.password_or_empty()))
    }
}

mod mongodb {
    use super::*;

    fn credentials(mut spec: CommandSpec, target: &DatabaseTarget) -> CommandSpec {
        if let Some(user) = target.user.as_deref().filter(|u| !u.is_empty()) {
            spec = spec.args(["--username", user]);
        }
        if let Some(password) = target.password.as_deref().filter(|p| !p.is_empty()) {
            spec = spec.arg("--password").secret_arg(password);
        }
        spec
    }

    fn scratch_dir(artifact: &Path, fallback: &str) -> String {
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| fallback.to_string());
        format!("/tmp/{}", name)
    }

    pub(super) fn dump(target: &DatabaseTarget, artifact: &Path) -> CommandPlan {
        match &target.mode {
            ExecutionMode::Direct => {
                let spec = CommandSpec::new("mongodump")
                    .arg("--host")
                    .arg(format!("{}:{}", target.host, target.port))
                    .args(["--db", target.database.as_str(), "--out"])
                    .arg(artifact.display().to_string());
                CommandPlan::single(credentials(spec, target))
            }
            ExecutionMode::Container(container) => {
                let scratch = scratch_dir(artifact, &target.database);
                let dump = docker_exec(container, None)
                    .arg("mongodump")
                    .arg("--host")
                    .arg(format!("localhost:{}", target.port))
                    .args(["--db", target.database.as_str(), "--out", scratch.as_str()]);
                let copy_out = CommandSpec::new("docker")
                    .arg("cp")
                    .arg(format!("{}:{}", container, scratch))
                    .arg(artifact.display().to_string());
                let cleanup = docker_exec(container, None).args(["rm", "-rf", scratch.as_str()]);

                CommandPlan {
                    steps: vec![credentials(dump, target), copy_out],
                    cleanup: vec![cleanup],
                }
            }
        }
    }

    pub(super) fn restore(target: &DatabaseTarget, source: &Path) -> CommandPlan {
        let dump_dir = source.join(&target.database);
        match &target.mode {
            ExecutionMode::Direct => {
                let spec = CommandSpec::new("mongorestore")
                    .arg("--host")
                    .arg(format!("{}:{}", target.host, target.port))
                    .args(["--db", target.database.as_str(), "--drop"])
                    .arg(dump_dir.display().to_string());
                CommandPlan::single(credentials(spec, target))
            }
            ExecutionMode::Container(container) => {
                let scratch = format!("/tmp/{}_restore", target.database);
                let copy_in = CommandSpec::new("docker")
                    .arg("cp")
                    .arg(dump_dir.display().to_string())
                    .arg(format!("{}:{}", container, scratch));
                let restore = docker_exec(container, None)
                    .arg("mongorestore")
                    .arg("--host")
                    .arg(format!("localhost:{}", target.port))
                    .args(["--db", target.database.as_str(), "--drop", scratch.as_str()]);
                let cleanup = docker_exec(container, None).args(["rm", "-rf", scratch.as_str()]);

                CommandPlan {
                    steps: vec![copy_in, credentials(restore, target)],
                    cleanup: vec![cleanup],
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(engine: EngineKind, mode: ExecutionMode) -> DatabaseTarget {
        DatabaseTarget {
            name: "shop".to_string(),
            engine,
            host: "db.internal".to_string(),
            port: 5432,
            user: Some("app".to_string()),
            password: Some("hunter2".to_string()),
            database: "shop".to_string(),
            backup_path: PathBuf::from("/backups/shop"),
            container: Some("shop-db".to_string()),
            mode,
            max_backups: 3,
        }
    }

    /// Arguments handed to the client itself, stripping the `docker exec` prefix
    /// and the connection parameters that legitimately differ between modes
    fn client_flags(spec: &CommandSpec) -> Vec<String> {
        spec.plain_args()
            .into_iter()
            .filter(|a| a.starts_with('-') && !a.starts_with("--host") && !a.starts_with("--port"))
            .filter(|a| !["-i", "-e", "-h", "-P", "-p"].contains(a))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_engine_parse_and_names() {
        assert_eq!(EngineKind::parse("MariaDB"), Some(EngineKind::MariaDb));
        assert_eq!(EngineKind::parse("postgresql"), Some(EngineKind::PostgreSql));
        assert_eq!(EngineKind::parse("mongodb"), Some(EngineKind::MongoDb));
        assert_eq!(EngineKind::parse("oracle"), None);

        assert_eq!(
            EngineKind::MariaDb.artifact_name("shop", "20240102_030405"),
            "shop_20240102_030405.sql"
        );
        assert_eq!(
            EngineKind::PostgreSql.artifact_name("shop", "20240102_030405"),
            "shop_20240102_030405.dump"
        );
        assert_eq!(
            EngineKind::MongoDb.artifact_name("shop", "20240102_030405"),
            "shop_20240102_030405"
        );
    }

    #[test]
    fn test_mariadb_direct_keeps_password_out_of_argv() {
        let artifact = Path::new("/backups/shop/shop_20240102_030405.sql");
        let plan = EngineKind::MariaDb.dump_plan(&target(EngineKind::MariaDb, ExecutionMode::Direct), artifact);
        let spec = &plan.steps[0];

        assert_eq!(spec.program, "mysqldump");
        assert!(!spec.argv().iter().any(|a| a.contains("hunter2")));
        assert_eq!(spec.env, vec![("MYSQL_PWD".to_string(), "hunter2".to_string())]);
        assert_eq!(spec.stdout.as_deref(), Some(artifact));
    }

    #[test]
    fn test_mariadb_container_passes_password_as_secret_arg() {
        let artifact = Path::new("/backups/shop/shop.sql");
        let mode = ExecutionMode::Container("shop-db".to_string());
        let plan = EngineKind::MariaDb.dump_plan(&target(EngineKind::MariaDb, mode), artifact);
        let spec = &plan.steps[0];

        assert_eq!(
            &spec.argv()[..5],
            &["exec", "-i", "shop-db", "mariadb-dump", "-h"]
        );
        assert!(spec.argv().contains(&"-phunter2"));
        assert!(!spec.to_string().contains("hunter2"));
    }

    #[test]
    fn test_dump_modes_use_same_client_flags() {
        let artifact = Path::new("/backups/shop/shop.out");
        for engine in [EngineKind::MariaDb, EngineKind::PostgreSql] {
            let direct = engine.dump_plan(&target(engine, ExecutionMode::Direct), artifact);
            let exec = engine.dump_plan(
                &target(engine, ExecutionMode::Container("shop-db".to_string())),
                artifact,
            );

            let mut direct_flags = client_flags(&direct.steps[0]);
            let mut exec_flags = client_flags(&exec.steps[0]);
            direct_flags.retain(|f| f != "-f" && !f.starts_with("--user") && f != "-u");
            exec_flags.retain(|f| f != "-f" && !f.starts_with("--user") && f != "-u");
            assert_eq!(direct_flags, exec_flags, "{} flags differ between modes", engine);
        }
    }

    #[test]
    fn test_postgres_container_forwards_password_through_env() {
        let artifact = Path::new("/backups/shop/shop.dump");
        let mode = ExecutionMode::Container("shop-db".to_string());
        let plan = EngineKind::PostgreSql.dump_plan(&target(EngineKind::PostgreSql, mode), artifact);
        let spec = &plan.steps[0];

        assert_eq!(
            &spec.argv()[..6],
            &["exec", "-i", "-e", "PGPASSWORD", "shop-db", "pg_dump"]
        );
        assert!(!spec.argv().iter().any(|a| a.contains("hunter2")));
        assert_eq!(spec.env[0].1, "hunter2");
        assert_eq!(spec.stdout.as_deref(), Some(artifact));
    }

    #[test]
    fn test_postgres_restore_cleans_first() {
        let source = Path::new("/backups/shop/shop.dump");
        let plan = EngineKind::PostgreSql.restore_plan(&target(EngineKind::PostgreSql, ExecutionMode::Direct), source);
        let argv = plan.steps[0].argv();

        assert!(argv.contains(&"--clean"));
        assert!(argv.contains(&"--if-exists"));
        assert_eq!(argv.last(), Some(&"/backups/shop/shop.dump"));
    }

    #[test]
    fn test_postgres_defaults_user() {
        let mut t = target(EngineKind::PostgreSql, ExecutionMode::Direct);
        t.user = None;
        let plan = EngineKind::PostgreSql.dump_plan(&t, Path::new("/tmp/x.dump"));
        let argv = plan.steps[0].argv();
        let pos = argv.iter().position(|a| *a == "-U").unwrap();
        assert_eq!(argv[pos + 1], "postgres");
    }

    #[test]
    fn test_mongodb_container_dump_copies_out_and_cleans_up() {
        let artifact = Path::new("/backups/shop/shop_20240102_030405");
        let mode = ExecutionMode::Container("mongo".to_string());
        let plan = EngineKind::MongoDb.dump_plan(&target(EngineKind::MongoDb, mode), artifact);

        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps[0]
            .argv()
            .ends_with(&["--out", "/tmp/shop_20240102_030405", "--username", "app", "--password", "hunter2"]));
        assert_eq!(
            plan.steps[1].argv(),
            vec!["cp", "mongo:/tmp/shop_20240102_030405", "/backups/shop/shop_20240102_030405"]
        );
        assert_eq!(
            plan.cleanup[0].argv(),
            vec!["exec", "-i", "mongo", "rm", "-rf", "/tmp/shop_20240102_030405"]
        );
    }

    #[test]
    fn test_mongodb_restore_drops_and_targets_database_dir() {
        let source = Path::new("/backups/shop/shop_20240102_030405");
        let plan = EngineKind::MongoDb.restore_plan(&target(EngineKind::MongoDb, ExecutionMode::Direct), source);
        let argv = plan.steps[0].argv();

        assert!(argv.contains(&"--drop"));
        assert!(argv.contains(&"/backups/shop/shop_20240102_030405/shop"));
        assert!(plan.cleanup.is_empty());
    }

    #[test]
    fn test_mongodb_without_credentials_omits_flags() {
        let mut t = target(EngineKind::MongoDb, ExecutionMode::Direct);
        t.user = None;
        t.password = None;
        let plan = EngineKind::MongoDb.dump_plan(&t, Path::new("/tmp/shop_x"));
        let argv = plan.steps[0].argv();
        assert!(!argv.contains(&"--username"));
        assert!(!argv.contains(&"--password"));
    }
}
