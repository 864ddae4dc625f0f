#![forbid(unsafe_code)]

//! Runtime settings from `.env`, the process environment and CLI overrides.
//!
//! Precedence is CLI, then environment, then the `.env` file, then built-in
//! defaults. Blank values count as unset at every level.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_YTDLP: &str = "yt-dlp";
pub const DEFAULT_WARUDO_DIR: &str =
    r"D:\SteamLibrary\steamapps\common\Warudo\Warudo_Data\StreamingAssets\Sounds";

const OUTPUT_DIR_KEY: &str = "YTRIP_OUTPUT_DIR";
const WARUDO_DIR_KEY: &str = "YTRIP_WARUDO_DIR";
const TOOLS_DIR_KEY: &str = "YTRIP_TOOLS_DIR";
const FFMPEG_PATH_KEY: &str = "YTRIP_FFMPEG_PATH";
const YTDLP_KEY: &str = "YTRIP_YTDLP";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Where downloads land when neither `-o` nor `--warudo` is given.
    pub output_dir: PathBuf,
    /// The sounds folder behind `--warudo`.
    pub warudo_dir: PathBuf,
    /// Install location for binaries the provisioner downloads.
    pub tools_dir: PathBuf,
    /// Extra place to look for ffmpeg before `PATH`.
    pub ffmpeg_path: Option<PathBuf>,
    /// The fetch engine executable.
    pub ytdlp: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub output_dir: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_settings(&file_vars, env_var_string, overrides)
}

fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Result<RuntimeSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup).map(PathBuf::from);

    let output_dir = non_blank_path(overrides.output_dir)
        .or_else(|| lookup(OUTPUT_DIR_KEY))
        .unwrap_or_else(|| PathBuf::from("."));
    let warudo_dir = lookup(WARUDO_DIR_KEY).unwrap_or_else(|| PathBuf::from(DEFAULT_WARUDO_DIR));
    let tools_dir = lookup(TOOLS_DIR_KEY).unwrap_or_else(default_tools_dir);
    let ffmpeg_path = non_blank_path(overrides.ffmpeg_path).or_else(|| lookup(FFMPEG_PATH_KEY));
    let ytdlp = lookup(YTDLP_KEY).unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP));

    Ok(RuntimeSettings {
        output_dir,
        warudo_dir,
        tools_dir,
        ffmpeg_path,
        ytdlp,
    })
}

fn default_tools_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("ytrip").join("bin"))
        .unwrap_or_else(|| PathBuf::from(".ytrip").join("bin"))
}

fn non_blank_path(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|path| !path.as_os_str().to_string_lossy().trim().is_empty())
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    let non_blank = |value: String| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };
    env_lookup(key)
        .and_then(non_blank)
        .or_else(|| file_vars.get(key).cloned().and_then(non_blank))
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
