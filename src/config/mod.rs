//! Import, validation, merging and export of server configuration files
//! from external tool ecosystems.
//!
//! All supported dialects are JSON objects that differ in the top-level
//! key holding the server map (`mcpServers`, `mcp.servers`,
//! `cursor.mcp.servers`) and slightly in per-entry shape. Entries that
//! cannot be converted are skipped with a per-entry error; a batch never
//! fails because of one bad entry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::config::{
    ClientKind, HttpMethod, Provenance, ServerConfig, TransportConfig, HTTP_TIMEOUT_DEFAULT_SECS,
};

/// Recognized configuration dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigFormat {
    ClaudeDesktop,
    Vscode,
    Cursor,
    /// Well-formed JSON with a recognizable server map under an
    /// unknown top-level shape.
    Generic,
}

impl ConfigFormat {
    fn top_level_key(&self) -> &'static str {
        match self {
            ConfigFormat::ClaudeDesktop | ConfigFormat::Generic => "mcpServers",
            ConfigFormat::Vscode => "mcp.servers",
            ConfigFormat::Cursor => "cursor.mcp.servers",
        }
    }

    fn client_kind(&self) -> ClientKind {
        match self {
            ConfigFormat::ClaudeDesktop => ClientKind::ClaudeDesktop,
            ConfigFormat::Vscode => ClientKind::Vscode,
            ConfigFormat::Cursor => ClientKind::Cursor,
            ConfigFormat::Generic => ClientKind::Generic,
        }
    }
}

/// Raw per-entry shape shared by all dialects. Stdio entries carry a
/// command; remote entries carry a url.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transport: Option<String>,
}

/// Result of parsing one file's content.
#[derive(Debug, Clone, Serialize)]
pub struct ParseOutcome {
    pub format: ConfigFormat,
    pub servers: Vec<ServerConfig>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// Result of parsing a batch of files.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    /// Per-file outcome, keyed by the caller-supplied file name. Files
    /// that failed outright map to an error string instead.
    pub files: Vec<FileOutcome>,
    pub total_servers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ParseOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of merging imported servers into an existing set.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub merged: Vec<ServerConfig>,
    pub added: usize,
    pub skipped: usize,
}

/// Classify file content as one of the known dialects.
///
/// Fails fast with [`Error::MalformedJson`] on non-JSON input and
/// [`Error::UnrecognizedFormat`] when no server map can be located.
pub fn detect_format(content: &str) -> Result<ConfigFormat> {
    let json: Value =
        serde_json::from_str(content).map_err(|e| Error::MalformedJson(e.to_string()))?;
    let obj = json.as_object().ok_or(Error::UnrecognizedFormat)?;

    if obj.contains_key("cursor.mcp.servers") {
        return Ok(ConfigFormat::Cursor);
    }
    if obj.contains_key("mcp.servers") {
        return Ok(ConfigFormat::Vscode);
    }
    if obj.contains_key("mcpServers") {
        return Ok(ConfigFormat::ClaudeDesktop);
    }
    // Generic: the object itself looks like a name -> entry map.
    if !obj.is_empty()
        && obj.values().all(|v| {
            v.as_object()
                .map_or(false, |e| e.contains_key("command") || e.contains_key("url"))
        })
    {
        return Ok(ConfigFormat::Generic);
    }
    Err(Error::UnrecognizedFormat)
}

/// Parse one file's content into server configurations.
pub fn parse(content: &str) -> Result<ParseOutcome> {
    parse_with_source(content, None)
}

/// Like [`parse`], recording the source path in each entry's provenance.
pub fn parse_with_source(content: &str, source_path: Option<&str>) -> Result<ParseOutcome> {
    let format = detect_format(content)?;
    let json: Value =
        serde_json::from_str(content).map_err(|e| Error::MalformedJson(e.to_string()))?;

    let map = match format {
        ConfigFormat::Generic => json.as_object().cloned().unwrap_or_default(),
        other => json
            .get(other.top_level_key())
            .and_then(Value::as_object)
            .cloned()
            .ok_or(Error::UnrecognizedFormat)?,
    };

    let mut servers = Vec::new();
    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    // Deterministic order regardless of map iteration.
    let mut names: Vec<&String> = map.keys().collect();
    names.sort();

    for name in names {
        let raw: RawEntry = match serde_json::from_value(map[name].clone()) {
            Ok(raw) => raw,
            Err(e) => {
                errors.push(format!("server '{name}': {e}"));
                continue;
            }
        };
        match convert_entry(name, &raw, format, source_path, &mut warnings) {
            Some(server) => servers.push(server),
            None => errors.push(format!("server '{name}' has neither command nor url")),
        }
    }

    if servers.is_empty() && !map.is_empty() {
        warnings.push("no convertible servers found".into());
    }

    Ok(ParseOutcome {
        format,
        servers,
        warnings,
        errors,
    })
}

fn convert_entry(
    name: &str,
    raw: &RawEntry,
    format: ConfigFormat,
    source_path: Option<&str>,
    warnings: &mut Vec<String>,
) -> Option<ServerConfig> {
    let transport = if let Some(url) = raw.url.as_ref().filter(|u| !u.is_empty()) {
        let headers = if raw.headers.is_empty() {
            None
        } else {
            Some(raw.headers.clone())
        };
        // Remote: dialects spell the transport as "http" or (default) "sse".
        if raw.transport.as_deref() == Some("http") {
            TransportConfig::Http {
                url: url.clone(),
                method: HttpMethod::Post,
                headers,
                timeout_secs: HTTP_TIMEOUT_DEFAULT_SECS,
            }
        } else {
            TransportConfig::Sse {
                url: url.clone(),
                headers,
                sse_endpoint: None,
                post_endpoint: None,
            }
        }
    } else if let Some(command) = raw.command.as_ref().filter(|c| !c.is_empty()) {
        if !command.contains('/') && !command.contains('\\') {
            warnings.push(format!(
                "server '{name}': command '{command}' must be resolvable on PATH"
            ));
        }
        TransportConfig::Stdio {
            command: command.clone(),
            args: raw.args.clone(),
            env: raw.env.clone(),
            cwd: raw.cwd.clone(),
        }
    } else {
        return None;
    };

    let mut server = ServerConfig::new(name, transport);
    server.provenance = Some(Provenance {
        client: format.client_kind(),
        source_path: source_path.map(str::to_string),
    });
    Some(server)
}

/// Parse several files, preserving which file contributed which
/// error/warning/server. Succeeds iff at least one file yields at least
/// one server.
pub fn parse_files(files: &[(String, String)]) -> Result<BatchOutcome> {
    let mut outcomes = Vec::with_capacity(files.len());
    let mut total = 0;

    for (file, content) in files {
        match parse_with_source(content, Some(file)) {
            Ok(outcome) => {
                total += outcome.servers.len();
                outcomes.push(FileOutcome {
                    file: file.clone(),
                    outcome: Some(outcome),
                    error: None,
                });
            }
            Err(e) => outcomes.push(FileOutcome {
                file: file.clone(),
                outcome: None,
                error: Some(e.to_string()),
            }),
        }
    }

    if total == 0 {
        return Err(Error::InvalidConfig(
            "no importable servers in any file".into(),
        ));
    }
    Ok(BatchOutcome {
        files: outcomes,
        total_servers: total,
    })
}

fn dedup_key(server: &ServerConfig) -> (String, &'static str, String) {
    (
        server.name.clone(),
        server.transport.kind(),
        server.transport.defining_field().to_string(),
    )
}

/// Merge imported servers into an existing set.
///
/// Equality is (name, transport kind, defining field). Existing entries
/// are never overwritten; new entries are appended in input order. The
/// operation is idempotent: re-merging the same incoming set is a no-op.
pub fn merge(existing: Vec<ServerConfig>, incoming: Vec<ServerConfig>) -> MergeOutcome {
    let mut seen: std::collections::HashSet<_> = existing.iter().map(dedup_key).collect();
    let mut merged = existing;
    let mut added = 0;
    let mut skipped = 0;

    for server in incoming {
        let key = dedup_key(&server);
        if seen.contains(&key) {
            skipped += 1;
            continue;
        }
        seen.insert(key);
        merged.push(server);
        added += 1;
    }

    MergeOutcome {
        merged,
        added,
        skipped,
    }
}

/// Render servers back out in a chosen dialect (pretty JSON).
pub fn export(servers: &[ServerConfig], format: ConfigFormat) -> Result<String> {
    let mut map = serde_json::Map::new();

    for server in servers {
        let raw = match &server.transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => RawEntry {
                command: Some(command.clone()),
                args: args.clone(),
                env: env.clone(),
                cwd: cwd.clone(),
                ..Default::default()
            },
            TransportConfig::Sse { url, headers, .. } => RawEntry {
                url: Some(url.clone()),
                headers: headers.clone().unwrap_or_default(),
                transport: Some("sse".into()),
                ..Default::default()
            },
            TransportConfig::Http { url, headers, .. } => RawEntry {
                url: Some(url.clone()),
                headers: headers.clone().unwrap_or_default(),
                transport: Some("http".into()),
                ..Default::default()
            },
        };
        map.insert(server.name.clone(), serde_json::to_value(raw)?);
    }

    let doc = match format {
        ConfigFormat::Generic => Value::Object(map),
        other => serde_json::json!({ other.top_level_key(): map }),
    };
    Ok(serde_json::to_string_pretty(&doc)?)
}
