use std::fmt::Write as _;
use std::path::Path;

use crate::error::{PlatformError, Result};
use crate::models::AppDescriptor;

/// Scripts a project declares in `package.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectManifest {
    pub has_start: bool,
    pub has_dev: bool,
    pub has_build: bool,
}

impl ProjectManifest {
    pub fn read(project_root: &Path) -> Result<Self> {
        let path = project_root.join("package.json");
        let raw = std::fs::read_to_string(&path).map_err(|_| {
            PlatformError::Validation(
                "This is not a valid web project (no package.json found)".into(),
            )
        })?;
        let manifest: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
            PlatformError::Validation(format!("package.json is not valid JSON: {e}"))
        })?;
        let script = |name: &str| {
            manifest
                .get("scripts")
                .and_then(|s| s.get(name))
                .and_then(|v| v.as_str())
                .is_some_and(|v| !v.trim().is_empty())
        };
        Ok(Self {
            has_start: script("start"),
            has_dev: script("dev"),
            has_build: script("build"),
        })
    }

    /// A deployable project must expose a `start` or `dev` script.
    pub fn require_runnable(&self) -> Result<()> {
        if self.has_start || self.has_dev {
            Ok(())
        } else {
            Err(PlatformError::Validation(
                "This is not a valid web project (no start/dev script found in package.json)"
                    .into(),
            ))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStrategy {
    Yarn,
    Pnpm,
    NpmCi,
    NpmInstall,
}

impl InstallStrategy {
    /// Chosen by whichever lockfile the project ships.
    pub fn for_project(project_root: &Path) -> Self {
        if project_root.join("yarn.lock").exists() {
            InstallStrategy::Yarn
        } else if project_root.join("pnpm-lock.yaml").exists() {
            InstallStrategy::Pnpm
        } else if project_root.join("package-lock.json").exists() {
            InstallStrategy::NpmCi
        } else {
            InstallStrategy::NpmInstall
        }
    }

    fn lockfile(self) -> Option<&'static str> {
        match self {
            InstallStrategy::Yarn => Some("yarn.lock"),
            InstallStrategy::Pnpm => Some("pnpm-lock.yaml"),
            InstallStrategy::NpmCi | InstallStrategy::NpmInstall => None,
        }
    }

    fn install(self) -> &'static str {
        match self {
            InstallStrategy::Yarn => "yarn install --frozen-lockfile",
            InstallStrategy::Pnpm => "npm install -g pnpm && pnpm install --frozen-lockfile",
            InstallStrategy::NpmCi => "npm ci",
            InstallStrategy::NpmInstall => "npm install",
        }
    }

    fn run_build(self) -> &'static str {
        match self {
            InstallStrategy::Yarn => "yarn build",
            InstallStrategy::Pnpm => "pnpm run build",
            InstallStrategy::NpmCi | InstallStrategy::NpmInstall => "npm run build",
        }
    }

    fn prune(self) -> &'static str {
        match self {
            InstallStrategy::Yarn => "yarn install --production --frozen-lockfile --ignore-scripts",
            InstallStrategy::Pnpm => "pnpm prune --prod",
            InstallStrategy::NpmCi | InstallStrategy::NpmInstall => "npm prune --omit=dev",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartCommand {
    NpmStart,
    NpmRunDev,
    Shell(String),
}

impl StartCommand {
    fn exec_form(&self) -> String {
        let argv: Vec<&str> = match self {
            StartCommand::NpmStart => vec!["npm", "start"],
            StartCommand::NpmRunDev => vec!["npm", "run", "dev"],
            StartCommand::Shell(cmd) => vec!["sh", "-c", cmd.as_str()],
        };
        serde_json::to_string(&argv).unwrap_or_else(|_| "[\"npm\", \"start\"]".into())
    }
}

/// Container build recipe for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub node_version: String,
    pub internal_port: u16,
    pub install: InstallStrategy,
    pub build: Option<String>,
    pub start: StartCommand,
}

impl ImageSpec {
    pub fn synthesize(
        project_root: &Path,
        manifest: &ProjectManifest,
        app: &AppDescriptor,
        internal_port: u16,
    ) -> Self {
        let install = InstallStrategy::for_project(project_root);
        let build = match app.build_command.as_deref().map(str::trim) {
            Some(cmd) if !cmd.is_empty() => Some(cmd.to_string()),
            _ if manifest.has_build => Some(install.run_build().to_string()),
            _ => None,
        };
        let start = match app.start_command.as_deref().map(str::trim) {
            Some(cmd) if !cmd.is_empty() && cmd != "npm start" => StartCommand::Shell(cmd.to_string()),
            _ if manifest.has_start => StartCommand::NpmStart,
            _ => StartCommand::NpmRunDev,
        };
        Self {
            node_version: app.node_version.trim().to_string(),
            internal_port,
            install,
            build,
            start,
        }
    }

    /// Render the Dockerfile.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "FROM node:{}-alpine", self.node_version);
        out.push_str("\nWORKDIR /app\n\n");
        out.push_str("COPY package*.json ./\n");
        if let Some(lockfile) = self.install.lockfile() {
            let _ = writeln!(out, "COPY {lockfile} ./");
        }
        let _ = writeln!(out, "RUN {}", self.install.install());
        out.push_str("\nCOPY . .\n");
        if let Some(build) = &self.build {
            let _ = writeln!(out, "\nRUN {build}");
        }
        // Dev servers need their dev dependencies at runtime.
        if self.start != StartCommand::NpmRunDev {
            let _ = writeln!(out, "RUN {}", self.install.prune());
        }
        out.push_str(
            "\nRUN addgroup -g 1001 -S nodejs && \\\n    adduser -S app -u 1001 -G nodejs && \\\n    chown -R app:nodejs /app\nUSER app\n",
        );
        let _ = writeln!(out, "\nEXPOSE {}", self.internal_port);
        let _ = writeln!(out, "ENV PORT={}", self.internal_port);
        out.push_str("ENV NODE_ENV=production\n");
        let _ = writeln!(out, "\nCMD {}", self.start.exec_form());
        out
    }

    pub fn write_dockerfile(&self, project_root: &Path) -> Result<()> {
        std::fs::write(project_root.join("Dockerfile"), self.render())?;
        Ok(())
    }
}
