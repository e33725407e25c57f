//! Repository-host source: git mirrors plus hosting metadata.
//!
//! One unit per `owner/name` repository. The repository itself is kept as
//! a `--mirror` clone updated with `git remote update --prune`; the
//! hosting side (issues, comments, releases) is fetched from the API as
//! JSON documents, gated by per-resource etags so an unchanged resource
//! costs one conditional request and zero writes. A full pass drops the
//! etag gate, which also refreshes documents whose upstream objects were
//! deleted. Scrubs run `git fsck` over the mirror — corruption there is
//! an integrity failure — and an etag-less metadata pass.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

use backhaul_core::config::{Config, RepoHostUnit};
use backhaul_core::fsutil;
use backhaul_core::types::{SourceKind, Unit, UnitOutcome};

use crate::cmd::{self, CmdStatus};
use crate::error::{http_err, io_err, SourceError};
use crate::{Depth, JobContext, Source};

const MIRROR_DIR: &str = "repo.git";
const META_DIR: &str = "meta";
const STATE_FILE: &str = ".etags.json";
const METADATA_RESOURCES: [&str; 3] = ["issues", "comments", "releases"];

/// Per-resource etags recorded after each successful metadata fetch.
#[derive(Debug, Default, Serialize, Deserialize)]
struct EtagState {
    #[serde(default)]
    etags: BTreeMap<String, String>,
}

impl EtagState {
    fn load(path: &Path) -> Result<EtagState, SourceError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EtagState::default()),
            Err(e) => Err(io_err(path, e)),
        }
    }

    fn save(&self, path: &Path) -> Result<(), SourceError> {
        let json = serde_json::to_vec_pretty(self)?;
        fsutil::update_file(path, &json).map_err(|e| io_err(path, e))?;
        Ok(())
    }
}

pub struct RepoHostSource {
    units: BTreeMap<String, RepoHostUnit>,
    git: String,
    api_base: Option<String>,
    clone_base: Option<String>,
    token: Option<String>,
    agent: ureq::Agent,
}

impl RepoHostSource {
    pub fn new(config: &Config) -> Self {
        RepoHostSource {
            units: config.repo_host.clone(),
            git: config.settings.repo_git_binary.clone(),
            api_base: config.settings.repo_api_base.clone(),
            clone_base: config.settings.repo_clone_base.clone(),
            token: config.settings.repo_api_token.clone(),
            agent: ureq::Agent::new(),
        }
    }

    fn unit_config(&self, unit: &Unit) -> Result<&RepoHostUnit, SourceError> {
        self.units
            .get(&unit.name.0)
            .ok_or_else(|| SourceError::UnknownUnit {
                name: unit.name.0.clone(),
            })
    }

    fn clone_url(&self, full_name: &str, info: &RepoHostUnit) -> Result<String, SourceError> {
        if let Some(url) = &info.clone_url {
            return Ok(url.clone());
        }
        let base = self
            .clone_base
            .as_deref()
            .ok_or_else(|| SourceError::Tool {
                tool: "repo-host".into(),
                detail: format!(
                    "no clone-url for {full_name} and settings.repo-clone-base is unset"
                ),
            })?;
        Ok(format!("{}/{full_name}.git", base.trim_end_matches('/')))
    }

    /// Clone or update the mirror. Returns the failing stage on error.
    fn sync_mirror(
        &self,
        unit: &Unit,
        ctx: &JobContext,
        url: &str,
    ) -> Result<Result<(), UnitOutcome>, SourceError> {
        let unit_dir = ctx.unit_dir(unit);
        std::fs::create_dir_all(&unit_dir).map_err(|e| io_err(&unit_dir, e))?;
        let mirror = unit_dir.join(MIRROR_DIR);
        let log_dir = ctx.unit_log_dir(unit);

        let mut git = Command::new(&self.git);
        if mirror.join("HEAD").exists() {
            git.current_dir(&mirror)
                .args(["remote", "update", "--prune"]);
        } else {
            git.current_dir(&unit_dir)
                .args(["clone", "--mirror", url, MIRROR_DIR]);
        }
        let outcome = cmd::run_logged(git, &log_dir, ctx.timeout)?;
        Ok(match outcome.status {
            CmdStatus::Success => Ok(()),
            CmdStatus::TimedOut { after } => Err(UnitOutcome::TimedOut {
                after_secs: after.as_secs(),
            }),
            CmdStatus::Failed { code } => Err(UnitOutcome::TransferFailed {
                reason: format!(
                    "git exited with {code}: {}",
                    outcome.excerpt.unwrap_or_default()
                ),
            }),
        })
    }

    /// Fetch the hosting metadata documents. Returns how many changed.
    fn sync_metadata(
        &self,
        unit: &Unit,
        ctx: &JobContext,
        use_etags: bool,
    ) -> Result<usize, SourceError> {
        let Some(api_base) = &self.api_base else {
            return Ok(0);
        };
        let unit_dir = ctx.unit_dir(unit);
        let meta_dir = unit_dir.join(META_DIR);
        std::fs::create_dir_all(&meta_dir).map_err(|e| io_err(&meta_dir, e))?;
        let state_path = unit_dir.join(STATE_FILE);
        let mut state = EtagState::load(&state_path)?;

        let mut changed = 0;
        for resource in METADATA_RESOURCES {
            let url = metadata_url(api_base, &unit.name.0, resource);
            let mut request = self.agent.get(&url).set("Accept", "application/json");
            if let Some(token) = &self.token {
                request = request.set("Authorization", &format!("Bearer {token}"));
            }
            if use_etags {
                if let Some(etag) = state.etags.get(resource) {
                    request = request.set("If-None-Match", etag);
                }
            }

            let response = match request.call() {
                Ok(response) => response,
                // 304: the stored document is current.
                Err(ureq::Error::Status(304, _)) => continue,
                Err(e) => return Err(http_err(e)),
            };
            let etag = response.header("etag").map(str::to_owned);
            let mut body = Vec::new();
            response
                .into_reader()
                .read_to_end(&mut body)
                .map_err(|e| io_err(&meta_dir, e))?;

            let doc_path = meta_dir.join(format!("{resource}.json"));
            if fsutil::update_file(&doc_path, &body).map_err(|e| io_err(&doc_path, e))? {
                changed += 1;
            }
            if let Some(etag) = etag {
                state.etags.insert(resource.to_string(), etag);
            }
        }
        state.save(&state_path)?;
        Ok(changed)
    }
}

impl Source for RepoHostSource {
    fn kind(&self) -> SourceKind {
        SourceKind::RepoHost
    }

    fn list_units(&self) -> Vec<Unit> {
        self.units
            .keys()
            .map(|full_name| {
                Unit::with_relroot(
                    SourceKind::RepoHost,
                    full_name.as_str(),
                    Path::new(SourceKind::RepoHost.label()).join(full_name),
                )
            })
            .collect()
    }

    fn backup(
        &self,
        unit: &Unit,
        ctx: &JobContext,
        depth: Depth,
    ) -> Result<UnitOutcome, SourceError> {
        let info = self.unit_config(unit)?;
        let url = self.clone_url(&unit.name.0, info)?;
        if let Err(outcome) = self.sync_mirror(unit, ctx, &url)? {
            return Ok(outcome);
        }
        let changed = self.sync_metadata(unit, ctx, depth == Depth::Incremental)?;
        Ok(UnitOutcome::Success { changed: changed > 0 })
    }

    fn scrub(&self, unit: &Unit, ctx: &JobContext) -> Result<UnitOutcome, SourceError> {
        let mirror = ctx.unit_dir(unit).join(MIRROR_DIR);
        if !mirror.join("HEAD").exists() {
            return Ok(UnitOutcome::TransferFailed {
                reason: "no mirror to scrub; back up first".into(),
            });
        }
        let log_dir = ctx.unit_log_dir(unit);
        let mut fsck = Command::new(&self.git);
        fsck.current_dir(&mirror).args(["fsck", "--full", "--strict"]);
        let outcome = cmd::run_logged(fsck, &log_dir, ctx.timeout)?;
        if !outcome.status.success() {
            return Ok(UnitOutcome::ScrubFailed {
                reason: format!(
                    "git fsck failed for {}: {}",
                    unit.name,
                    outcome.excerpt.unwrap_or_default()
                ),
            });
        }
        let changed = self.sync_metadata(unit, ctx, false)?;
        Ok(UnitOutcome::Success { changed: changed > 0 })
    }
}

fn metadata_url(api_base: &str, full_name: &str, resource: &str) -> String {
    format!(
        "{}/repos/{full_name}/{resource}?state=all",
        api_base.trim_end_matches('/')
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
