//! Persona template discovery and caching.
//!
//! Personas are `.md`/`.txt` files in the oracles directory. The file
//! stem is the persona id; the first top-level heading is the display
//! name. The registry caches scan results with a short TTL so dropped-in
//! files become visible without a restart.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::types::{CoreError, CoreResult};

/// A discovered persona template.
#[derive(Debug, Clone)]
pub struct Persona {
    /// File stem, used in callback tokens and artifact names
    pub id: String,
    /// First `# heading` of the file, or the id when absent
    pub display_name: String,
    pub template: String,
    pub path: PathBuf,
}

struct CacheSlot {
    scanned_at: Instant,
    personas: Vec<Persona>,
}

/// TTL-cached view over the oracles directory.
pub struct PersonaRegistry {
    dir: PathBuf,
    ttl: Duration,
    cache: Mutex<Option<CacheSlot>>,
}

impl PersonaRegistry {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// All currently known personas, sorted by id.
    pub async fn list(&self) -> CoreResult<Vec<Persona>> {
        let mut cache = self.cache.lock().await;
        if let Some(slot) = cache.as_ref() {
            if slot.scanned_at.elapsed() < self.ttl {
                return Ok(slot.personas.clone());
            }
        }
        let personas = self.scan()?;
        *cache = Some(CacheSlot {
            scanned_at: Instant::now(),
            personas: personas.clone(),
        });
        Ok(personas)
    }

    /// Look up one persona by id.
    pub async fn get(&self, id: &str) -> CoreResult<Persona> {
        self.list()
            .await?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| {
                CoreError::validation("unknown_persona", format!("no persona named '{id}'"))
            })
    }

    /// Drop the cache so the next list() rescans immediately.
    pub async fn refresh(&self) {
        *self.cache.lock().await = None;
    }

    fn scan(&self) -> CoreResult<Vec<Persona>> {
        let mut personas = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "oracles directory absent");
                return Ok(personas);
            }
            Err(e) => return Err(CoreError::io("read oracles dir", e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| CoreError::io("read oracles dir", e))?;
            let path = entry.path();
            let is_template = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e, "md" | "txt"))
                .unwrap_or(false);
            if !path.is_file() || !is_template {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let template = match std::fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable persona skipped");
                    continue;
                }
            };
            let display_name = first_heading(&template).unwrap_or_else(|| id.clone());
            personas.push(Persona {
                id,
                display_name,
                template,
                path,
            });
        }
        personas.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(count = personas.len(), "persona scan complete");
        Ok(personas)
    }
}

/// First `# ` heading of a markdown-ish template.
fn first_heading(template: &str) -> Option<String> {
    template.lines().find_map(|line| {
        let line = line.trim();
        line.strip_prefix("# ")
            .map(|rest| rest.trim().to_string())
            .filter(|name| !name.is_empty())
    })
}
