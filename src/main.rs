use chrono::{DateTime, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

const CONTROLLER_NAME: &str = "hotspotctl";
const DAEMON_NAME: &str = "hotspotd";

const REEXEC_ENV: &str = "HOTSPOT_REEXEC";
const SRC_DIR_ENV: &str = "HOTSPOT_SRC_DIR";
const INSTALL_ROOT_ENV: &str = "HOTSPOT_INSTALL_ROOT";
const REPO_ORG_ENV: &str = "HOTSPOT_REPO_ORG";
const REPO_NAME_ENV: &str = "HOTSPOT_REPO_NAME";
const REPO_BRANCH_ENV: &str = "HOTSPOT_REPO_BRANCH";
const REPO_VERSION_ENV: &str = "HOTSPOT_REPO_VERSION";
const RELEASE_BASE_URL_ENV: &str = "HOTSPOT_RELEASE_BASE_URL";

const DEFAULT_REPO_ORG: &str = "hotspotd";
const DEFAULT_REPO_NAME: &str = "hotspotd";
const DEFAULT_REPO_BRANCH: &str = "main";

const REQUIRED_PACKAGES: &[&str] = &["hostapd", "dnsmasq"];
const SHELL_TOKENS: &[&str] = &["sh", "bash", "dash", "zsh", "ksh"];

// Any deeper and the host layout is considered pathological rather than a
// checkout we failed to spot.
const VCS_SEARCH_MAX_DEPTH: usize = 10;

const EXIT_CLASSIFICATION: i32 = 3;

#[derive(Parser, Debug)]
#[command(
    name = "hotspotctl",
    about = "Bootstrap and controller for the fallback access-point daemon",
    disable_version_flag = true
)]
struct Cli {
    #[arg(long, short = 'd')]
    dry_run: bool,
    #[arg(long, short = 'v')]
    version: bool,
    #[arg(long = "log-file", short = 'f')]
    log_file: Option<PathBuf>,
    #[arg(long = "log-level", short = 'l', default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"])]
    log_level: String,
    #[arg(long, short = 't')]
    terse: bool,
    #[arg(long, short = 'c')]
    console: bool,
}

#[derive(Debug, Error)]
enum BootstrapError {
    #[error("classification error: {0}")]
    Classification(String),
    #[error("privilege error: {0}")]
    Privilege(String),
    #[error("fetch error: {0}")]
    Fetch(String),
    #[error("install error: {0}")]
    Install(String),
    #[error("replacement error: {0}")]
    Replacement(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl BootstrapError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Classification(_) => EXIT_CLASSIFICATION,
            _ => 1,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct DaemonConfig {
    version: u32,
    access_point: AccessPointConfig,
    scan: ScanConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct AccessPointConfig {
    ssid: String,
    passphrase: String,
    channel: u8,
    interface: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct ScanConfig {
    interval_sec: u64,
    known_networks: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            version: 1,
            access_point: AccessPointConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            ssid: "hotspot".to_string(),
            passphrase: "ChangeMe123".to_string(),
            channel: 6,
            interface: "wlan0".to_string(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval_sec: 120,
            known_networks: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
struct InstallManifest {
    version: String,
    installed_at: DateTime<Utc>,
    context: String,
    organization: String,
    repository_name: String,
    branch: String,
    controller_path: String,
    daemon_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvocationContext {
    Piped,
    UnusualShell,
    Direct,
    InSourceCheckout,
    InstalledOnPath,
}

impl InvocationContext {
    fn name(&self) -> &'static str {
        match self {
            Self::Piped => "piped",
            Self::UnusualShell => "unusual-shell",
            Self::Direct => "direct",
            Self::InSourceCheckout => "in-source-checkout",
            Self::InstalledOnPath => "installed-on-path",
        }
    }

    fn flags(&self) -> ContextFlags {
        match self {
            Self::Piped | Self::UnusualShell => ContextFlags {
                use_local_source: false,
                in_repo: false,
                on_path: false,
            },
            Self::Direct => ContextFlags {
                use_local_source: true,
                in_repo: false,
                on_path: false,
            },
            Self::InSourceCheckout => ContextFlags {
                use_local_source: true,
                in_repo: true,
                on_path: false,
            },
            Self::InstalledOnPath => ContextFlags {
                use_local_source: false,
                in_repo: false,
                on_path: true,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ContextFlags {
    use_local_source: bool,
    in_repo: bool,
    on_path: bool,
}

#[derive(Debug, Clone)]
struct ClassifiedContext {
    context: InvocationContext,
    flags: ContextFlags,
    vcs_root: Option<PathBuf>,
}

impl ClassifiedContext {
    fn new(context: InvocationContext, vcs_root: Option<PathBuf>) -> Self {
        Self {
            context,
            flags: context.flags(),
            vcs_root,
        }
    }
}

#[derive(Debug, Clone)]
struct ScriptIdentity {
    resolved_path: PathBuf,
    basename: String,
    resolved: bool,
    is_reexec: bool,
}

#[derive(Debug, Clone)]
struct PrivilegeProbe {
    euid: u32,
    sudo_user: Option<String>,
    sudo_command: Option<String>,
}

#[derive(Debug, Clone)]
struct OwnerIdentity {
    user: String,
    uid: u32,
    gid: u32,
}

#[derive(Debug, Clone)]
struct RepoCoordinates {
    organization: String,
    repository_name: String,
    branch: String,
    semantic_version: String,
}

#[derive(Debug, Clone)]
struct SourceSnapshot {
    controller: PathBuf,
    daemon: PathBuf,
    default_config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct InstallTarget {
    root: PathBuf,
    controller_path: PathBuf,
    daemon_path: PathBuf,
    config_path: PathBuf,
    manifest_path: PathBuf,
    service_path: PathBuf,
    timer_path: PathBuf,
}

fn install_target_under(root: &Path) -> InstallTarget {
    InstallTarget {
        root: root.to_path_buf(),
        controller_path: root.join("usr/sbin").join(CONTROLLER_NAME),
        daemon_path: root.join("usr/bin").join(DAEMON_NAME),
        config_path: root.join("etc/hotspotd/config.yaml"),
        manifest_path: root.join("etc/hotspotd/installed.yaml"),
        service_path: root.join("etc/systemd/system/hotspotd.service"),
        timer_path: root.join("etc/systemd/system/hotspotd.timer"),
    }
}

#[derive(Debug, Clone, Default)]
struct InstallReport {
    packages_checked: bool,
    controller_installed: bool,
    daemon_installed: bool,
    config_seeded: bool,
    units_provisioned: bool,
    simulated: bool,
}

#[derive(Debug, Clone)]
struct BootstrapConfig {
    dry_run: bool,
    invocation_token: String,
    forward_args: Vec<String>,
    cwd: PathBuf,
    stdin_is_pipe: bool,
    privilege: PrivilegeProbe,
    is_reexec: bool,
    src_dir: Option<PathBuf>,
    install_root: PathBuf,
}

struct BootstrapDeps<'a> {
    lookup: &'a dyn PathLookup,
    fetcher: &'a dyn SourceFetcher,
    units: &'a dyn UnitProvisioner,
    packages: &'a dyn PackageManager,
    image: &'a dyn ProcessImage,
}

#[derive(Debug)]
enum ReplacementOutcome {
    Simulated {
        target: PathBuf,
        envs: BTreeMap<String, String>,
    },
}

#[derive(Debug)]
enum BootstrapOutcome {
    ReexecComplete,
    Replaced(ReplacementOutcome),
}

#[derive(Default)]
struct PhaseTrace {
    phases: Vec<&'static str>,
}

impl PhaseTrace {
    fn enter(&mut self, phase: &'static str) {
        debug!(phase, "entering bootstrap phase");
        self.phases.push(phase);
    }

    fn render(&self) -> String {
        self.phases.join(" > ")
    }
}

trait PathLookup {
    fn lookup(&self, name: &str) -> Option<PathBuf>;
}

struct WhichLookup;

impl PathLookup for WhichLookup {
    fn lookup(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }
}

trait SourceFetcher {
    fn fetch_snapshot(
        &self,
        coords: &RepoCoordinates,
        dest: &Path,
    ) -> Result<SourceSnapshot, BootstrapError>;
}

trait UnitProvisioner {
    fn provision(&self, target: &InstallTarget) -> Result<(), BootstrapError>;
}

trait PackageManager {
    fn ensure_installed(&self, packages: &[&str]) -> Result<(), BootstrapError>;
}

trait ProcessImage {
    fn replace(
        &self,
        name: &str,
        target: &Path,
        args: &[String],
        envs: &BTreeMap<String, String>,
    ) -> Result<ReplacementOutcome, BootstrapError>;
}

fn main() {
    let cli = parse_cli();
    if cli.version {
        println!("hotspotctl {}", env!("CARGO_PKG_VERSION"));
        return;
    }
    let mut log_guard = match init_logging(&cli) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("hotspotctl: {err}");
            std::process::exit(1);
        }
    };

    let cfg = bootstrap_config_from_env(&cli);
    let lookup = WhichLookup;
    let fetcher = GitHubFetcher;
    let units = SystemdProvisioner;
    let packages = AptPackageManager;
    let image: Box<dyn ProcessImage> = if cfg.dry_run {
        Box::new(DryProcessImage)
    } else {
        Box::new(ExecProcessImage)
    };
    let deps = BootstrapDeps {
        lookup: &lookup,
        fetcher: &fetcher,
        units: &units,
        packages: &packages,
        image: image.as_ref(),
    };

    let mut trace = PhaseTrace::default();
    match run_bootstrap(&cfg, &deps, &mut trace, &mut log_guard) {
        Ok(BootstrapOutcome::ReexecComplete) => {
            if let Err(err) = hand_off_to_controller(&cfg) {
                error!("hand-off failed: {err}");
                eprintln!("hotspotctl: {err}");
                drop(log_guard);
                std::process::exit(err.exit_code());
            }
        }
        Ok(BootstrapOutcome::Replaced(outcome)) => {
            if let Err(err) = report_simulated(&outcome) {
                error!("report failed: {err}");
                eprintln!("hotspotctl: {err}");
                drop(log_guard);
                std::process::exit(err.exit_code());
            }
        }
        Err(err) => {
            error!("bootstrap failed: {err}");
            eprintln!("hotspotctl: {err}");
            eprintln!("hotspotctl: trace: {}", trace.render());
            drop(log_guard);
            std::process::exit(err.exit_code());
        }
    }
}

fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            use clap::error::ErrorKind;
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    }
}

fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>, BootstrapError> {
    let level = match cli.log_level.as_str() {
        "DEBUG" => Level::DEBUG,
        "WARNING" => Level::WARN,
        "ERROR" | "CRITICAL" => Level::ERROR,
        _ => Level::INFO,
    };
    let (writer, guard): (BoxMakeWriter, Option<WorkerGuard>) = match &cli.log_file {
        Some(path) => {
            ensure_parent(path)?;
            let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let writer = if cli.console {
                BoxMakeWriter::new(non_blocking.and(io::stderr))
            } else {
                BoxMakeWriter::new(non_blocking)
            };
            (writer, Some(guard))
        }
        None => (BoxMakeWriter::new(io::stderr), None),
    };
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(writer)
        .with_ansi(false);
    if cli.terse {
        builder.without_time().with_target(false).init();
    } else {
        builder.init();
    }
    Ok(guard)
}

fn bootstrap_config_from_env(cli: &Cli) -> BootstrapConfig {
    let mut args = env::args();
    let invocation_token = args.next().unwrap_or_else(|| CONTROLLER_NAME.to_string());
    let forward_args: Vec<String> = args.collect();
    BootstrapConfig {
        dry_run: cli.dry_run,
        invocation_token,
        forward_args,
        cwd: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        stdin_is_pipe: stdin_is_pipe(),
        privilege: PrivilegeProbe {
            euid: effective_uid(),
            sudo_user: env_non_empty("SUDO_USER"),
            sudo_command: env_non_empty("SUDO_COMMAND"),
        },
        is_reexec: reexec_flag_value(env::var(REEXEC_ENV).ok().as_deref()),
        src_dir: env_non_empty(SRC_DIR_ENV).map(PathBuf::from),
        install_root: env_non_empty(INSTALL_ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/")),
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn reexec_flag_value(raw: Option<&str>) -> bool {
    matches!(
        raw.map(str::trim),
        Some("1") | Some("true") | Some("yes")
    )
}

fn effective_uid() -> u32 {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() }
    }
    #[cfg(not(unix))]
    {
        u32::MAX
    }
}

#[cfg(unix)]
fn stdin_is_pipe() -> bool {
    use std::os::unix::io::AsRawFd;
    let fd = io::stdin().as_raw_fd();
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    (stat.st_mode as u32 & libc::S_IFMT as u32) == libc::S_IFIFO as u32
}

#[cfg(not(unix))]
fn stdin_is_pipe() -> bool {
    false
}

fn resolve_script_identity(token: &str, cwd: &Path, is_reexec: bool) -> ScriptIdentity {
    let basename = Path::new(token)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| token.to_string());
    match fs::canonicalize(token) {
        Ok(resolved_path) => ScriptIdentity {
            resolved_path,
            basename,
            resolved: true,
            is_reexec,
        },
        Err(_) => ScriptIdentity {
            resolved_path: cwd.join(&basename),
            basename,
            resolved: false,
            is_reexec,
        },
    }
}

fn is_bare_shell_token(token: &str) -> bool {
    !token.contains('/') && SHELL_TOKENS.contains(&token)
}

fn find_vcs_root(start: &Path, max_depth: usize) -> Result<Option<PathBuf>, BootstrapError> {
    let mut dir = start;
    for _ in 0..max_depth {
        if dir.join(".git").exists() {
            return Ok(Some(dir.to_path_buf()));
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => return Ok(None),
        }
    }
    Err(BootstrapError::Classification(format!(
        "no version-control root within {} levels of {}",
        max_depth,
        start.display()
    )))
}

fn paths_refer_to_same(a: &Path, b: &Path) -> bool {
    let left = fs::canonicalize(a).unwrap_or_else(|_| a.to_path_buf());
    let right = fs::canonicalize(b).unwrap_or_else(|_| b.to_path_buf());
    left == right
}

fn classify_context(
    token: &str,
    stdin_is_pipe: bool,
    identity: &ScriptIdentity,
    lookup: &dyn PathLookup,
) -> Result<ClassifiedContext, BootstrapError> {
    if is_bare_shell_token(token) {
        if stdin_is_pipe {
            return Ok(ClassifiedContext::new(InvocationContext::Piped, None));
        }
        warn!("bare shell invocation without piped input");
        return Ok(ClassifiedContext::new(InvocationContext::UnusualShell, None));
    }
    if !identity.resolved {
        // No on-disk file backs this process; behave as if the program text
        // arrived over a pipe.
        return Ok(ClassifiedContext::new(InvocationContext::Piped, None));
    }
    let start = identity
        .resolved_path
        .parent()
        .unwrap_or_else(|| Path::new("/"));
    if let Some(root) = find_vcs_root(start, VCS_SEARCH_MAX_DEPTH)? {
        return Ok(ClassifiedContext::new(
            InvocationContext::InSourceCheckout,
            Some(root),
        ));
    }
    if let Some(hit) = lookup.lookup(&identity.basename) {
        if paths_refer_to_same(&hit, &identity.resolved_path) {
            return Ok(ClassifiedContext::new(
                InvocationContext::InstalledOnPath,
                None,
            ));
        }
    }
    Ok(ClassifiedContext::new(InvocationContext::Direct, None))
}

fn enforce_privilege(probe: &PrivilegeProbe, basename: &str) -> Result<String, BootstrapError> {
    if probe.euid != 0 {
        return Err(BootstrapError::Privilege(format!(
            "not running with elevated privileges; re-run as: sudo {basename}"
        )));
    }
    let user = match probe.sudo_user.as_deref() {
        Some(user) if user != "root" => user.to_string(),
        _ => {
            return Err(BootstrapError::Privilege(
                "running as root with no originating user recorded (SUDO_USER is unset); \
                 invoke through sudo from a regular account"
                    .to_string(),
            ));
        }
    };
    let references_script = probe
        .sudo_command
        .as_deref()
        .map(|command| command.contains(basename))
        .unwrap_or(false);
    if !references_script {
        return Err(BootstrapError::Privilege(format!(
            "elevated shell invocation detected (SUDO_COMMAND does not reference {basename}); \
             run the bootstrap directly: sudo {basename}"
        )));
    }
    Ok(user)
}

fn default_coordinates() -> RepoCoordinates {
    RepoCoordinates {
        organization: env_non_empty(REPO_ORG_ENV).unwrap_or_else(|| DEFAULT_REPO_ORG.to_string()),
        repository_name: env_non_empty(REPO_NAME_ENV)
            .unwrap_or_else(|| DEFAULT_REPO_NAME.to_string()),
        branch: env_non_empty(REPO_BRANCH_ENV).unwrap_or_else(|| DEFAULT_REPO_BRANCH.to_string()),
        semantic_version: env_non_empty(REPO_VERSION_ENV)
            .unwrap_or_else(|| format!("v{}", env!("CARGO_PKG_VERSION"))),
    }
}

fn git_output(root: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git").arg("-C").arg(root).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn parse_github_remote(url: &str) -> Option<(String, String)> {
    let trimmed = url.trim().trim_end_matches(".git");
    let rest = trimmed
        .strip_prefix("git@github.com:")
        .or_else(|| trimmed.strip_prefix("https://github.com/"))
        .or_else(|| trimmed.strip_prefix("http://github.com/"))
        .or_else(|| trimmed.strip_prefix("ssh://git@github.com/"))?;
    let mut parts = rest.splitn(2, '/');
    let organization = parts.next()?.to_string();
    let repository_name = parts.next()?.to_string();
    if organization.is_empty() || repository_name.is_empty() {
        return None;
    }
    Some((organization, repository_name))
}

fn coordinates_from_checkout(root: &Path) -> RepoCoordinates {
    let mut coords = default_coordinates();
    if let Some(remote) = git_output(root, &["remote", "get-url", "origin"]) {
        if let Some((organization, repository_name)) = parse_github_remote(&remote) {
            coords.organization = organization;
            coords.repository_name = repository_name;
        }
    }
    if let Some(branch) = git_output(root, &["rev-parse", "--abbrev-ref", "HEAD"]) {
        coords.branch = branch;
    }
    coords
}

fn release_platform() -> Result<(String, String), BootstrapError> {
    if env::consts::OS != "linux" {
        return Err(BootstrapError::Config(format!(
            "unsupported operating system for bootstrap: {}",
            env::consts::OS
        )));
    }
    let arch = match env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "armv7",
        value => {
            return Err(BootstrapError::Config(format!(
                "unsupported architecture for bootstrap: {value}"
            )))
        }
    };
    Ok(("linux".to_string(), arch.to_string()))
}

fn release_base_url(coords: &RepoCoordinates) -> String {
    let raw = env_non_empty(RELEASE_BASE_URL_ENV).unwrap_or_else(|| {
        format!(
            "https://github.com/{}/{}/releases/download",
            coords.organization, coords.repository_name
        )
    });
    raw.trim_end_matches('/').to_string()
}

#[derive(Debug, Deserialize)]
struct GitHubReleasePayload {
    tag_name: String,
}

fn normalize_version_tag(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('v') {
        trimmed.to_string()
    } else {
        format!("v{trimmed}")
    }
}

fn fetch_latest_release_tag(coords: &RepoCoordinates) -> Result<String, BootstrapError> {
    let url = format!(
        "https://api.github.com/repos/{}/{}/releases/latest",
        coords.organization, coords.repository_name
    );
    let client = reqwest::blocking::Client::new();
    let response = client
        .get(&url)
        .header("Accept", "application/vnd.github+json")
        .header("User-Agent", "hotspotctl")
        .send()?;
    let status = response.status();
    if !status.is_success() {
        return Err(BootstrapError::Fetch(format!(
            "failed to resolve latest release: HTTP {status}"
        )));
    }
    let payload: GitHubReleasePayload = response.json()?;
    Ok(normalize_version_tag(&payload.tag_name))
}

fn download_file(url: &str, path: &Path) -> Result<(), BootstrapError> {
    let client = reqwest::blocking::Client::new();
    let response = client.get(url).header("User-Agent", "hotspotctl").send()?;
    let status = response.status();
    if !status.is_success() {
        return Err(BootstrapError::Fetch(format!(
            "download failed: {url} (HTTP {status})"
        )));
    }
    let bytes = response.bytes()?;
    ensure_parent(path)?;
    fs::write(path, &bytes)?;
    Ok(())
}

fn parse_checksum(content: &str) -> Option<String> {
    for raw in content.split_whitespace() {
        let candidate = raw
            .trim_matches(|c: char| !c.is_ascii_hexdigit())
            .to_lowercase();
        if candidate.len() == 64 && candidate.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some(candidate);
        }
    }
    None
}

fn sha256_file(path: &Path) -> Result<String, BootstrapError> {
    let path_str = path.to_string_lossy().to_string();
    let attempts: Vec<(&str, Vec<String>)> = vec![
        ("sha256sum", vec![path_str.clone()]),
        (
            "shasum",
            vec!["-a".to_string(), "256".to_string(), path_str.clone()],
        ),
        (
            "openssl",
            vec!["dgst".to_string(), "-sha256".to_string(), path_str],
        ),
    ];
    for (program, args) in attempts {
        let output = Command::new(program).args(&args).output();
        let Ok(output) = output else { continue };
        if !output.status.success() {
            continue;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(token) = parse_checksum(&stdout) {
            return Ok(token);
        }
    }
    Err(BootstrapError::Fetch(
        "no SHA256 tool found (expected sha256sum, shasum, or openssl)".to_string(),
    ))
}

fn verify_checksum(artifact_path: &Path, checksum_path: &Path) -> Result<(), BootstrapError> {
    let checksum_content = fs::read_to_string(checksum_path)?;
    let Some(expected) = parse_checksum(&checksum_content) else {
        return Err(BootstrapError::Fetch(format!(
            "invalid checksum file: {}",
            checksum_path.display()
        )));
    };
    let actual = sha256_file(artifact_path)?;
    if expected != actual {
        return Err(BootstrapError::Fetch(format!(
            "checksum mismatch for {}: expected {expected}, got {actual}",
            artifact_path.display()
        )));
    }
    Ok(())
}

struct GitHubFetcher;

impl SourceFetcher for GitHubFetcher {
    fn fetch_snapshot(
        &self,
        coords: &RepoCoordinates,
        dest: &Path,
    ) -> Result<SourceSnapshot, BootstrapError> {
        fs::create_dir_all(dest)?;
        let version = if coords.semantic_version == "latest" {
            fetch_latest_release_tag(coords)?
        } else {
            coords.semantic_version.clone()
        };
        let (os, arch) = release_platform()?;
        let base = format!("{}/{version}", release_base_url(coords));
        for name in [CONTROLLER_NAME, DAEMON_NAME] {
            let artifact = format!("{name}_{os}_{arch}");
            let url = format!("{base}/{artifact}");
            let path = dest.join(name);
            info!(url = url.as_str(), "downloading artifact");
            download_file(&url, &path)?;
            let checksum_path = dest.join(format!("{name}.sha256"));
            download_file(&format!("{url}.sha256"), &checksum_path)?;
            verify_checksum(&path, &checksum_path)?;
            set_executable(&path)?;
        }
        let config_url = format!(
            "https://raw.githubusercontent.com/{}/{}/{}/config/default.yaml",
            coords.organization, coords.repository_name, coords.branch
        );
        let config_path = dest.join("default.yaml");
        download_file(&config_url, &config_path)?;
        Ok(SourceSnapshot {
            controller: dest.join(CONTROLLER_NAME),
            daemon: dest.join(DAEMON_NAME),
            default_config: Some(config_path),
        })
    }
}

fn local_snapshot(
    identity: &ScriptIdentity,
    repo_root: Option<&Path>,
    dry_run: bool,
) -> Result<SourceSnapshot, BootstrapError> {
    let source_dir = identity
        .resolved_path
        .parent()
        .unwrap_or_else(|| Path::new("."));
    let daemon = source_dir.join(DAEMON_NAME);
    if !daemon.exists() {
        if dry_run {
            warn!(
                "daemon executable not found at {}; a live run would fail here",
                daemon.display()
            );
        } else {
            return Err(BootstrapError::Install(format!(
                "daemon executable not found next to {}; expected {}",
                identity.resolved_path.display(),
                daemon.display()
            )));
        }
    }
    let default_config = repo_root
        .map(|root| root.join("config/default.yaml"))
        .filter(|path| path.exists());
    Ok(SourceSnapshot {
        controller: identity.resolved_path.clone(),
        daemon,
        default_config,
    })
}

fn temp_snapshot_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    env::temp_dir().join(format!("hotspotctl-fetch-{}-{}", std::process::id(), nanos))
}

fn ensure_parent(path: &Path) -> Result<(), BootstrapError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn set_executable(path: &Path) -> Result<(), BootstrapError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

fn write_atomic_text_file(
    path: &Path,
    content: &str,
    mode: Option<u32>,
) -> Result<(), BootstrapError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| CONTROLLER_NAME.to_string()),
        pid,
        ts
    ));
    fs::write(&tmp_path, content)?;
    let finish = || -> Result<(), BootstrapError> {
        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        fs::rename(&tmp_path, path)?;
        Ok(())
    };
    if let Err(err) = finish() {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

fn install_file(
    source: &Path,
    dest: &Path,
    mode: u32,
    owner: Option<&OwnerIdentity>,
) -> Result<(), BootstrapError> {
    ensure_parent(dest)?;
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        dest.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| CONTROLLER_NAME.to_string()),
        pid,
        ts
    ));
    fs::copy(source, &tmp_path).map_err(|err| {
        BootstrapError::Install(format!(
            "failed to copy {} to {}: {err}",
            source.display(),
            tmp_path.display()
        ))
    })?;
    let finish = || -> Result<(), BootstrapError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
            if let Some(owner) = owner {
                std::os::unix::fs::chown(&tmp_path, Some(owner.uid), Some(owner.gid)).map_err(
                    |err| {
                        BootstrapError::Install(format!(
                            "failed to chown {} to {}: {err}",
                            tmp_path.display(),
                            owner.user
                        ))
                    },
                )?;
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (mode, owner);
        }
        // rename keeps a running previous generation intact; overwriting the
        // busy file in place would not.
        fs::rename(&tmp_path, dest)?;
        Ok(())
    };
    if let Err(err) = finish() {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

fn id_number(user: &str, flag: &str) -> Option<u32> {
    let output = Command::new("id").arg(flag).arg(user).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

fn resolve_owner(user: &str) -> Option<OwnerIdentity> {
    let uid = id_number(user, "-u")?;
    let gid = id_number(user, "-g")?;
    Some(OwnerIdentity {
        user: user.to_string(),
        uid,
        gid,
    })
}

fn service_unit(target: &InstallTarget) -> String {
    format!(
        "[Unit]\n\
         Description=Fallback access point daemon\n\
         After=network.target\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         ExecStart={}\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        target.daemon_path.display()
    )
}

fn timer_unit() -> String {
    "[Unit]\n\
     Description=Periodic fallback access point check\n\
     \n\
     [Timer]\n\
     OnBootSec=30s\n\
     OnUnitActiveSec=2min\n\
     \n\
     [Install]\n\
     WantedBy=timers.target\n"
        .to_string()
}

struct SystemdProvisioner;

impl UnitProvisioner for SystemdProvisioner {
    fn provision(&self, target: &InstallTarget) -> Result<(), BootstrapError> {
        write_atomic_text_file(&target.service_path, &service_unit(target), Some(0o644))?;
        write_atomic_text_file(&target.timer_path, &timer_unit(), Some(0o644))?;
        if target.root != Path::new("/") {
            debug!("install root override set; skipping systemctl");
            return Ok(());
        }
        run_systemctl(&["daemon-reload"])?;
        run_systemctl(&["enable", "--now", "hotspotd.timer"])?;
        Ok(())
    }
}

fn run_systemctl(args: &[&str]) -> Result<(), BootstrapError> {
    let output = Command::new("systemctl")
        .args(args)
        .output()
        .map_err(|err| BootstrapError::Install(format!("failed to run systemctl: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BootstrapError::Install(format!(
            "systemctl {} failed with status {}: {}",
            args.join(" "),
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

struct AptPackageManager;

impl PackageManager for AptPackageManager {
    fn ensure_installed(&self, packages: &[&str]) -> Result<(), BootstrapError> {
        let missing: Vec<&str> = packages
            .iter()
            .copied()
            .filter(|package| which::which(package).is_err())
            .collect();
        if missing.is_empty() {
            debug!("all required packages present");
            return Ok(());
        }
        info!(packages = %missing.join(", "), "installing missing packages");
        let output = Command::new("apt-get")
            .arg("install")
            .arg("-y")
            .args(&missing)
            .output()
            .map_err(|err| BootstrapError::Install(format!("failed to run apt-get: {err}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BootstrapError::Install(format!(
                "apt-get install failed with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

fn seed_config(
    config_path: &Path,
    snapshot_config: Option<&Path>,
) -> Result<bool, BootstrapError> {
    if config_path.exists() {
        let existing = fs::read_to_string(config_path)?;
        if serde_yaml::from_str::<DaemonConfig>(&existing).is_err() {
            warn!(
                "existing config at {} does not parse; leaving it untouched",
                config_path.display()
            );
        }
        return Ok(false);
    }
    let content = match snapshot_config {
        Some(path) => fs::read_to_string(path)?,
        None => DEFAULT_CONFIG_YAML.to_string(),
    };
    write_atomic_text_file(config_path, &content, Some(0o644))?;
    Ok(true)
}

fn write_manifest(
    target: &InstallTarget,
    coords: &RepoCoordinates,
    context: &InvocationContext,
) -> Result<(), BootstrapError> {
    let manifest = InstallManifest {
        version: coords.semantic_version.clone(),
        installed_at: Utc::now(),
        context: context.name().to_string(),
        organization: coords.organization.clone(),
        repository_name: coords.repository_name.clone(),
        branch: coords.branch.clone(),
        controller_path: target.controller_path.to_string_lossy().to_string(),
        daemon_path: target.daemon_path.to_string_lossy().to_string(),
    };
    let content = serde_yaml::to_string(&manifest)?;
    write_atomic_text_file(&target.manifest_path, &content, Some(0o644))
}

fn read_manifest(path: &Path) -> Option<InstallManifest> {
    let content = fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&content).ok()
}

#[allow(clippy::too_many_arguments)]
fn run_install(
    target: &InstallTarget,
    snapshot: &SourceSnapshot,
    owner: Option<&OwnerIdentity>,
    coords: &RepoCoordinates,
    context: &InvocationContext,
    units: &dyn UnitProvisioner,
    packages: &dyn PackageManager,
    dry_run: bool,
) -> Result<InstallReport, BootstrapError> {
    if dry_run {
        info!(
            "dry-run: would ensure packages are installed: {}",
            REQUIRED_PACKAGES.join(", ")
        );
        info!(
            "dry-run: would install controller {} -> {}",
            snapshot.controller.display(),
            target.controller_path.display()
        );
        info!(
            "dry-run: would install daemon {} -> {}",
            snapshot.daemon.display(),
            target.daemon_path.display()
        );
        info!(
            "dry-run: would seed config at {} when absent",
            target.config_path.display()
        );
        info!(
            "dry-run: would provision {} and {}",
            target.service_path.display(),
            target.timer_path.display()
        );
        return Ok(InstallReport {
            simulated: true,
            ..InstallReport::default()
        });
    }
    packages.ensure_installed(REQUIRED_PACKAGES)?;
    install_file(&snapshot.controller, &target.controller_path, 0o755, owner)?;
    install_file(&snapshot.daemon, &target.daemon_path, 0o755, owner)?;
    let config_seeded = seed_config(&target.config_path, snapshot.default_config.as_deref())?;
    write_manifest(target, coords, context)?;
    units.provision(target)?;
    Ok(InstallReport {
        packages_checked: true,
        controller_installed: true,
        daemon_installed: true,
        config_seeded,
        units_provisioned: true,
        simulated: false,
    })
}

struct ExecProcessImage;

impl ProcessImage for ExecProcessImage {
    fn replace(
        &self,
        name: &str,
        target: &Path,
        args: &[String],
        envs: &BTreeMap<String, String>,
    ) -> Result<ReplacementOutcome, BootstrapError> {
        ensure_executable_target(target)?;
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            let mut cmd = Command::new(target);
            cmd.arg0(name);
            cmd.args(args);
            cmd.envs(envs);
            let err = cmd.exec();
            // exec only returns on failure; the image was never replaced.
            Err(BootstrapError::Replacement(format!(
                "exec of {} failed: {err}",
                target.display()
            )))
        }
        #[cfg(not(unix))]
        {
            let _ = (name, args, envs);
            Err(BootstrapError::Replacement(
                "process replacement is only supported on unix hosts".to_string(),
            ))
        }
    }
}

fn ensure_executable_target(target: &Path) -> Result<(), BootstrapError> {
    let metadata = fs::metadata(target).map_err(|_| {
        BootstrapError::Replacement(format!(
            "replacement target does not exist: {}",
            target.display()
        ))
    })?;
    if !metadata.is_file() {
        return Err(BootstrapError::Replacement(format!(
            "replacement target is not a regular file: {}",
            target.display()
        )));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(BootstrapError::Replacement(format!(
                "replacement target is not executable: {}",
                target.display()
            )));
        }
    }
    Ok(())
}

struct DryProcessImage;

impl ProcessImage for DryProcessImage {
    fn replace(
        &self,
        name: &str,
        target: &Path,
        args: &[String],
        envs: &BTreeMap<String, String>,
    ) -> Result<ReplacementOutcome, BootstrapError> {
        let env_text = envs
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(name, target = %target.display(), "simulating process replacement");
        thread::sleep(Duration::from_millis(300));
        println!(
            "dry-run: would replace process with {} (args: {:?}) carrying {}",
            target.display(),
            args,
            env_text
        );
        Ok(ReplacementOutcome::Simulated {
            target: target.to_path_buf(),
            envs: envs.clone(),
        })
    }
}

fn run_bootstrap(
    cfg: &BootstrapConfig,
    deps: &BootstrapDeps<'_>,
    trace: &mut PhaseTrace,
    log_guard: &mut Option<WorkerGuard>,
) -> Result<BootstrapOutcome, BootstrapError> {
    trace.enter("resolve-identity");
    let identity = resolve_script_identity(&cfg.invocation_token, &cfg.cwd, cfg.is_reexec);
    debug!(
        path = %identity.resolved_path.display(),
        resolved = identity.resolved,
        "script identity resolved"
    );

    trace.enter("classify");
    let classified = classify_context(
        &cfg.invocation_token,
        cfg.stdin_is_pipe,
        &identity,
        deps.lookup,
    )?;
    info!(context = classified.context.name(), "execution context resolved");
    if classified.context == InvocationContext::UnusualShell {
        return Err(BootstrapError::Classification(
            "interactive shell invocation without piped input; re-run via the documented \
             curl pipeline or from a source checkout"
                .to_string(),
        ));
    }

    trace.enter("privilege");
    if identity.is_reexec {
        debug!("re-exec generation; privilege was checked by the previous generation");
    } else if cfg.dry_run {
        info!("dry-run: skipping privilege enforcement");
    } else {
        let user = enforce_privilege(&cfg.privilege, &identity.basename)?;
        debug!(user = %user, "privilege pattern accepted");
    }

    if identity.is_reexec {
        trace.enter("reexec-handoff");
        info!("re-exec generation detected; skipping fetch and install");
        return Ok(BootstrapOutcome::ReexecComplete);
    }

    let target = install_target_under(&cfg.install_root);
    let flags = classified.flags;
    let coords = match classified.vcs_root.as_deref() {
        Some(root) if flags.in_repo => coordinates_from_checkout(root),
        _ => default_coordinates(),
    };

    trace.enter("acquire-source");
    let mut fetched_dir: Option<PathBuf> = None;
    let snapshot = if flags.on_path {
        None
    } else if flags.use_local_source {
        Some(local_snapshot(
            &identity,
            classified.vcs_root.as_deref(),
            cfg.dry_run,
        )?)
    } else if cfg.dry_run {
        info!(
            "dry-run: would fetch {}/{} {} from remote release storage",
            coords.organization, coords.repository_name, coords.semantic_version
        );
        None
    } else {
        let dest = temp_snapshot_dir();
        match deps.fetcher.fetch_snapshot(&coords, &dest) {
            Ok(snapshot) => {
                fetched_dir = Some(dest);
                Some(snapshot)
            }
            Err(err) => {
                // Never leave a half-fetched snapshot behind.
                let _ = fs::remove_dir_all(&dest);
                return Err(err);
            }
        }
    };

    trace.enter("install");
    let already_installed =
        flags.on_path || paths_refer_to_same(&identity.resolved_path, &target.controller_path);
    if already_installed {
        info!(
            "controller already installed at {}; skipping installation",
            target.controller_path.display()
        );
    } else if let Some(snapshot) = &snapshot {
        let owner = if cfg.dry_run {
            None
        } else {
            match cfg.privilege.sudo_user.as_deref() {
                Some(user) => {
                    let owner = resolve_owner(user);
                    if owner.is_none() {
                        warn!(user = %user, "could not resolve uid/gid; keeping root ownership");
                    }
                    owner
                }
                None => None,
            }
        };
        let report = match run_install(
            &target,
            snapshot,
            owner.as_ref(),
            &coords,
            &classified.context,
            deps.units,
            deps.packages,
            cfg.dry_run,
        ) {
            Ok(report) => report,
            Err(err) => {
                // A failed install must not strand the fetched snapshot.
                if let Some(dir) = &fetched_dir {
                    let _ = fs::remove_dir_all(dir);
                }
                return Err(err);
            }
        };
        info!(
            packages = report.packages_checked,
            controller = report.controller_installed,
            daemon = report.daemon_installed,
            config_seeded = report.config_seeded,
            units = report.units_provisioned,
            simulated = report.simulated,
            "installation finished"
        );
    } else if cfg.dry_run {
        info!(
            "dry-run: would install controller to {}",
            target.controller_path.display()
        );
    }

    trace.enter("cleanup");
    if let Some(dir) = &fetched_dir {
        if let Err(err) = fs::remove_dir_all(dir) {
            warn!("failed to remove fetch snapshot {}: {err}", dir.display());
        }
    }

    trace.enter("replace");
    let exec_target = if cfg.dry_run || target.controller_path.exists() {
        target.controller_path.clone()
    } else {
        identity.resolved_path.clone()
    };
    let source_dir = if flags.in_repo {
        classified
            .vcs_root
            .clone()
            .unwrap_or_else(|| cfg.cwd.clone())
    } else if flags.use_local_source {
        identity
            .resolved_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cfg.cwd.clone())
    } else {
        target
            .controller_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/usr/sbin"))
    };
    let mut envs = BTreeMap::new();
    envs.insert(REEXEC_ENV.to_string(), "1".to_string());
    envs.insert(
        SRC_DIR_ENV.to_string(),
        source_dir.to_string_lossy().to_string(),
    );
    info!(
        target = %exec_target.display(),
        "handing over to the installed controller"
    );
    // The replacement never returns on success; flush file logging now.
    if let Some(guard) = log_guard.take() {
        drop(guard);
    }
    let outcome = deps
        .image
        .replace(CONTROLLER_NAME, &exec_target, &cfg.forward_args, &envs)?;
    Ok(BootstrapOutcome::Replaced(outcome))
}

fn hand_off_to_controller(cfg: &BootstrapConfig) -> Result<(), BootstrapError> {
    let target = install_target_under(&cfg.install_root);
    if let Some(src) = &cfg.src_dir {
        debug!(
            source_dir = %src.display(),
            "source directory carried over from the previous generation"
        );
    }
    match read_manifest(&target.manifest_path) {
        Some(manifest) => info!(
            version = manifest.version.as_str(),
            context = manifest.context.as_str(),
            "controller ready"
        ),
        None => debug!("no install manifest present"),
    }
    println!("hotspotctl: bootstrap complete; handing off to controller");
    Ok(())
}

fn report_simulated(outcome: &ReplacementOutcome) -> Result<(), BootstrapError> {
    let ReplacementOutcome::Simulated { target, envs } = outcome;
    let payload = json!({
        "simulated": true,
        "target": target,
        "environment": envs,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}
