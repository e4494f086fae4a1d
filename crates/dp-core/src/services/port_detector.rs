//! Best-effort inference of the port a Node-style project listens on.
//!
//! The scan is a heuristic: sources are consulted in a fixed priority order
//! and the first match wins. A result is a guess, never an authoritative
//! declaration.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

pub const DEFAULT_PORT: u16 = 3000;

/// Conventional entry points, root first, then `src/`.
const ENTRY_FILES: [&str; 16] = [
    "server.js",
    "index.js",
    "app.js",
    "main.js",
    "server.ts",
    "index.ts",
    "app.ts",
    "main.ts",
    "src/server.js",
    "src/index.js",
    "src/app.js",
    "src/main.js",
    "src/server.ts",
    "src/index.ts",
    "src/app.ts",
    "src/main.ts",
];

const ENV_FILES: [&str; 3] = [".env", ".env.local", ".env.production"];

const FRAMEWORK_CONFIGS: [&str; 9] = [
    "next.config.js",
    "next.config.mjs",
    "next.config.ts",
    "vue.config.js",
    "angular.json",
    "nuxt.config.js",
    "nuxt.config.ts",
    "vite.config.js",
    "vite.config.ts",
];

static SCRIPT_PORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:--port[=\s]\s*|-p\s+|\bPORT\s*=\s*|:)(\d+)").unwrap()
});

static CODE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)listen\s*\(\s*(\d+)",
        r"(?i)port\s*:\s*(\d+)",
        r"(?i)PORT\s*=\s*(\d+)",
        r"(?i)localhost:(\d+)",
        r"(?i)process\.env\.PORT\s*\|\|\s*(\d+)",
        r"(?i)app\.listen\s*\(\s*(\d+)",
        r"(?i)server\.listen\s*\(\s*(\d+)",
        r"(?i)\.listen\s*\(\s*(\d+)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static COMMENT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)//.*port.*?(\d{4})",
        r"(?i)console\.log.*port.*?(\d{4})",
        r"(?i)running.*?(\d{4})",
        r"(?i)localhost:(\d{4})",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static ENV_PORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?im)^\s*(?:export\s+)?PORT\s*=\s*["']?(\d+)"#).unwrap()
});

static CONFIG_PORT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)port.*?(\d+)").unwrap());

/// Where a detected port came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSource {
    Script(String),
    EntryCode(&'static str),
    EntryComment(&'static str),
    EnvFile(&'static str),
    FrameworkConfig(&'static str),
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDetection {
    pub port: u16,
    pub source: PortSource,
}

pub fn detect(project_root: &Path) -> u16 {
    detect_with_source(project_root).port
}

pub fn detect_with_source(project_root: &Path) -> PortDetection {
    let detection = from_scripts(project_root)
        .or_else(|| from_entry_files(project_root, &CODE_PATTERNS, PortSource::EntryCode))
        .or_else(|| from_entry_files(project_root, &COMMENT_PATTERNS, PortSource::EntryComment))
        .or_else(|| from_env_files(project_root))
        .or_else(|| from_framework_configs(project_root))
        .unwrap_or(PortDetection {
            port: DEFAULT_PORT,
            source: PortSource::Default,
        });
    debug!(
        root = %project_root.display(),
        port = detection.port,
        source = ?detection.source,
        "port detection finished"
    );
    detection
}

/// Framework label inferred from `package.json` dependencies, for logs and
/// status messages.
pub fn detect_framework(project_root: &Path) -> Option<&'static str> {
    let manifest = read_manifest(project_root)?;
    let has = |name: &str| {
        ["dependencies", "devDependencies"]
            .iter()
            .any(|section| manifest.get(section).and_then(|d| d.get(name)).is_some())
    };
    [
        ("next", "Next.js"),
        ("react", "React"),
        ("vue", "Vue.js"),
        ("@angular/core", "Angular"),
        ("express", "Express"),
        ("vite", "Vite"),
        ("nuxt", "Nuxt.js"),
        ("svelte", "Svelte"),
    ]
    .into_iter()
    .find(|(dep, _)| has(dep))
    .map(|(_, label)| label)
}

fn read_manifest(project_root: &Path) -> Option<serde_json::Value> {
    let raw = fs::read_to_string(project_root.join("package.json")).ok()?;
    serde_json::from_str(&raw).ok()
}

fn in_user_range(port: u32) -> Option<u16> {
    (1000..=65535).contains(&port).then_some(port as u16)
}

fn from_scripts(project_root: &Path) -> Option<PortDetection> {
    let manifest = read_manifest(project_root)?;
    let scripts = manifest.get("scripts")?.as_object()?;
    scripts.iter().find_map(|(name, script)| {
        let script = script.as_str()?;
        let port = SCRIPT_PORT
            .captures_iter(script)
            .find_map(|c| c[1].parse::<u16>().ok().filter(|p| *p > 0))?;
        Some(PortDetection {
            port,
            source: PortSource::Script(name.clone()),
        })
    })
}

/// Every pattern is tried in order against one file before moving on to the
/// next file.
fn from_entry_files(
    project_root: &Path,
    patterns: &[Regex],
    source: fn(&'static str) -> PortSource,
) -> Option<PortDetection> {
    ENTRY_FILES.into_iter().find_map(|file| {
        let content = fs::read_to_string(project_root.join(file)).ok()?;
        patterns.iter().find_map(|pattern| {
            pattern
                .captures_iter(&content)
                .find_map(|c| c[1].parse::<u32>().ok().and_then(in_user_range))
                .map(|port| PortDetection {
                    port,
                    source: source(file),
                })
        })
    })
}

fn from_env_files(project_root: &Path) -> Option<PortDetection> {
    ENV_FILES.into_iter().find_map(|file| {
        let content = fs::read_to_string(project_root.join(file)).ok()?;
        let port = ENV_PORT
            .captures(&content)
            .and_then(|c| c[1].parse::<u16>().ok())
            .filter(|p| *p > 0)?;
        Some(PortDetection {
            port,
            source: PortSource::EnvFile(file),
        })
    })
}

fn from_framework_configs(project_root: &Path) -> Option<PortDetection> {
    FRAMEWORK_CONFIGS.into_iter().find_map(|file| {
        let content = fs::read_to_string(project_root.join(file)).ok()?;
        let port = CONFIG_PORT
            .captures(&content)
            .and_then(|c| c[1].parse::<u32>().ok())
            .and_then(in_user_range)?;
        Some(PortDetection {
            port,
            source: PortSource::FrameworkConfig(file),
        })
    })
}
