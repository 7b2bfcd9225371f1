//! Toolchain adapter for an external `git` binary
//!
//! Every query the divergence computation needs is issued as one scoped
//! subprocess invocation: spawn, feed stdin from memory, capture stdout
//! and stderr, reap the child. Pipes and the process handle are released
//! on every exit path, including errors.
//!
//! The [`Toolchain`] trait is the capability boundary: the algorithms in
//! [`crate::divergence`] are written against it so they can be tested with
//! a fake implementation that never spawns a process.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::object::{ObjectId, ObjectKind, TreeEntry};

/// Result type for toolchain operations
pub type Result<T> = std::result::Result<T, ToolchainError>;

/// Errors that can occur while invoking the external toolchain
#[derive(Debug, thiserror::Error)]
pub enum ToolchainError {
    #[error("git binary not found: {0}")]
    GitNotFound(String),

    #[error("failed to {describe}: {source}")]
    Io {
        describe: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to {describe}: git exited with code {code}: {stderr}")]
    Failed {
        describe: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to {describe}: unexpected output: {detail}")]
    UnexpectedOutput { describe: String, detail: String },
}

/// Capability interface over the external version-control toolchain.
///
/// The divergence computation only ever talks to this trait; the concrete
/// [`GitToolchain`] implements it by shelling out.
pub trait Toolchain {
    /// Resolve a symbolic reference to an object id.
    fn resolve_ref(&self, ref_name: &str) -> Result<ObjectId>;

    /// All merge bases of the given commits.
    ///
    /// Returns an empty list when the commits share no history.
    fn merge_bases(&self, commits: &[ObjectId]) -> Result<Vec<ObjectId>>;

    /// Commits reachable from any tip but not from `base`, plus `base` itself.
    fn commits_between(&self, base: ObjectId, tips: &[ObjectId]) -> Result<Vec<ObjectId>>;

    /// The tree referenced by each commit, resolved in a single batched query.
    fn trees_of(&self, commits: &[ObjectId]) -> Result<Vec<ObjectId>>;

    /// Recursively flattened listing of a tree.
    fn list_tree(&self, tree: ObjectId) -> Result<Vec<TreeEntry>>;

    /// Produce a self-contained pack containing exactly the given objects.
    fn pack_objects(&self, objects: &[ObjectId]) -> Result<Vec<u8>>;

    /// Import a pack byte stream into the local store.
    fn unpack_objects(&self, pack: &[u8]) -> Result<()>;

    /// Create a new reference atomically, failing if it already exists.
    fn create_ref(&self, ref_name: &str, id: ObjectId) -> Result<()>;
}

/// Adapter that issues queries against an external `git` binary.
pub struct GitToolchain {
    bin: PathBuf,
}

impl GitToolchain {
    /// Create an adapter for the given binary, defaulting to `git` on PATH.
    pub fn new(bin: Option<PathBuf>) -> Self {
        Self {
            bin: bin.unwrap_or_else(|| PathBuf::from("git")),
        }
    }

    /// Run git, requiring exit code 0. Returns captured stdout.
    fn run(&self, describe: &str, args: &[&str], stdin: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let (code, stdout) = self.run_with(describe, args, stdin, &[])?;
        debug_assert_eq!(code, 0);
        Ok(stdout)
    }

    /// Run git, treating exit codes in `allowed` as success alongside 0.
    /// Returns the exit code and captured stdout.
    fn run_with(
        &self,
        describe: &str,
        args: &[&str],
        stdin: Option<Vec<u8>>,
        allowed: &[i32],
    ) -> Result<(i32, Vec<u8>)> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolchainError::GitNotFound(self.bin.display().to_string())
            } else {
                ToolchainError::Io {
                    describe: describe.to_string(),
                    source: e,
                }
            }
        })?;

        // Feed stdin from a separate thread: a large input (e.g. a long
        // object list) must not deadlock against the child filling its
        // stdout pipe.
        let writer = stdin.and_then(|data| {
            child.stdin.take().map(|mut pipe| {
                std::thread::spawn(move || {
                    let _ = pipe.write_all(&data);
                })
            })
        });

        let output = child.wait_with_output().map_err(|e| ToolchainError::Io {
            describe: describe.to_string(),
            source: e,
        })?;
        if let Some(handle) = writer {
            let _ = handle.join();
        }

        let code = output.status.code().unwrap_or(-1);
        if output.status.success() || allowed.contains(&code) {
            Ok((code, output.stdout))
        } else {
            Err(ToolchainError::Failed {
                describe: describe.to_string(),
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Run git and return trimmed stdout as a string.
    fn run_str(&self, describe: &str, args: &[&str]) -> Result<String> {
        let out = self.run(describe, args, None)?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    /// Toolchain version string, e.g. `git version 2.44.0`.
    pub fn version(&self) -> Result<String> {
        self.run_str("get git version", &["--version"])
    }

    /// Path of the repository's git directory.
    pub fn git_dir(&self) -> Result<PathBuf> {
        let out = self.run_str("get git dir", &["rev-parse", "--git-dir"])?;
        Ok(PathBuf::from(out))
    }

    /// All remote URLs pointing at known hosting services, deduplicated.
    pub fn remotes(&self) -> Result<Vec<String>> {
        let names = self.run_str("list remotes", &["remote"])?;
        let mut all = Vec::new();
        for name in names.lines().filter(|l| !l.is_empty()) {
            let urls = match self.run_str(
                &format!("get URLs for remote {}", name),
                &["remote", "get-url", "--all", name],
            ) {
                Ok(u) => u,
                Err(_) => continue,
            };
            for url in urls.lines() {
                if !url.contains("github.com") && !url.contains("gitlab.com") {
                    continue;
                }
                let url = url.to_string();
                if !all.contains(&url) {
                    all.push(url);
                }
            }
        }
        Ok(all)
    }

    /// Whether `ref_name` has an upstream configured.
    pub fn has_upstream(&self, ref_name: &str) -> Result<bool> {
        let upstream = format!("{}@{{upstream}}", ref_name);
        // Exit code 128 means "no upstream", which is an answer, not a failure.
        let (code, out) = self.run_with(
            &format!("check upstream of {}", ref_name),
            &["rev-parse", "--verify", upstream.as_str()],
            None,
            &[128],
        )?;
        Ok(code == 0 && !out.is_empty())
    }

    /// Resolve `ref_name` to a short, unambiguous ref name.
    ///
    /// Falls back to the commit hash when no shorter spelling exists.
    pub fn abbrev_ref(&self, ref_name: &str) -> Result<String> {
        let out = self.run_str(
            &format!("abbreviate {}", ref_name),
            &["rev-parse", "--abbrev-ref=loose", ref_name],
        )?;
        if out.is_empty() || out == ref_name {
            return Ok(self.resolve_ref(ref_name)?.to_hex());
        }
        Ok(out)
    }

    fn parse_id(describe: &str, line: &str) -> Result<ObjectId> {
        ObjectId::from_hex(line.trim()).map_err(|_| ToolchainError::UnexpectedOutput {
            describe: describe.to_string(),
            detail: format!("not an object id: {:?}", line),
        })
    }
}

impl Toolchain for GitToolchain {
    fn resolve_ref(&self, ref_name: &str) -> Result<ObjectId> {
        let describe = format!("resolve {}", ref_name);
        let out = self.run_str(&describe, &["rev-parse", ref_name])?;
        Self::parse_id(&describe, &out)
    }

    fn merge_bases(&self, commits: &[ObjectId]) -> Result<Vec<ObjectId>> {
        let describe = format!("get merge bases for {} commits", commits.len());
        let mut args = vec!["merge-base".to_string(), "--all".to_string()];
        args.extend(commits.iter().map(|c| c.to_hex()));
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        // Exit code 1 means "no common ancestor", an empty result rather than a failure.
        let (code, out) = self.run_with(&describe, &arg_refs, None, &[1])?;
        if code == 1 {
            return Ok(Vec::new());
        }
        String::from_utf8_lossy(&out)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Self::parse_id(&describe, l))
            .collect()
    }

    fn commits_between(&self, base: ObjectId, tips: &[ObjectId]) -> Result<Vec<ObjectId>> {
        let describe = format!("get commits between {} tips and {}", tips.len(), base);
        let mut args = vec!["rev-list".to_string()];
        args.extend(tips.iter().map(|t| t.to_hex()));
        args.push("--not".to_string());
        args.push(base.to_hex());
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let out = self.run(&describe, &arg_refs, None)?;
        let mut commits: Vec<ObjectId> = String::from_utf8_lossy(&out)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Self::parse_id(&describe, l))
            .collect::<Result<_>>()?;
        // The base anchors downstream tree resolution on a known-shared point.
        commits.push(base);
        Ok(commits)
    }

    fn trees_of(&self, commits: &[ObjectId]) -> Result<Vec<ObjectId>> {
        let describe = format!("get trees referenced by {} commits", commits.len());
        let mut batch = String::new();
        for commit in commits {
            batch.push_str(&format!("{}^{{tree}}\n", commit.to_hex()));
        }
        let out = self.run(
            &describe,
            &["cat-file", "--buffer", "--batch-check=%(objectname)"],
            Some(batch.into_bytes()),
        )?;
        let trees: Vec<ObjectId> = String::from_utf8_lossy(&out)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Self::parse_id(&describe, l))
            .collect::<Result<_>>()?;
        if trees.len() != commits.len() {
            return Err(ToolchainError::UnexpectedOutput {
                describe,
                detail: format!("asked for {} trees, got {}", commits.len(), trees.len()),
            });
        }
        Ok(trees)
    }

    fn list_tree(&self, tree: ObjectId) -> Result<Vec<TreeEntry>> {
        let describe = format!("list paths in {}", tree);
        let hex = tree.to_hex();
        let out = self.run(
            &describe,
            &[
                "ls-tree",
                "-r",
                "-t",
                "-z",
                "--format=%(objecttype) %(objectname) %(path)",
                hex.as_str(),
            ],
            None,
        )?;
        parse_tree_listing(&describe, &out)
    }

    fn pack_objects(&self, objects: &[ObjectId]) -> Result<Vec<u8>> {
        let describe = format!("pack {} objects", objects.len());
        let mut list = String::new();
        for obj in objects {
            list.push_str(&obj.to_hex());
            list.push('\n');
        }
        let pack = self.run(
            &describe,
            &["pack-objects", "--stdout", "--delta-base-offset", "-q"],
            Some(list.into_bytes()),
        )?;
        if !objects.is_empty() && pack.is_empty() {
            return Err(ToolchainError::UnexpectedOutput {
                describe,
                detail: "empty pack".to_string(),
            });
        }
        Ok(pack)
    }

    fn unpack_objects(&self, pack: &[u8]) -> Result<()> {
        let describe = format!("unpack {} bytes worth of objects", pack.len());
        self.run(&describe, &["unpack-objects", "-q"], Some(pack.to_vec()))?;
        Ok(())
    }

    fn create_ref(&self, ref_name: &str, id: ObjectId) -> Result<()> {
        let describe = format!("create ref {} -> {}", ref_name, id);
        let stdin = format!("create {}\0{}\0", ref_name, id.to_hex());
        self.run(
            &describe,
            &["update-ref", "--stdin", "-z"],
            Some(stdin.into_bytes()),
        )?;
        Ok(())
    }
}

/// Parse the NUL-separated output of a recursive `ls-tree` listing.
///
/// Within a tree, an entry of type `commit` is a submodule reference.
fn parse_tree_listing(describe: &str, out: &[u8]) -> Result<Vec<TreeEntry>> {
    let text = String::from_utf8_lossy(out);
    let mut entries = Vec::new();
    for line in text.split('\0') {
        if line.is_empty() {
            continue;
        }
        entries.push(parse_tree_entry(describe, line)?);
    }
    Ok(entries)
}

fn parse_tree_entry(describe: &str, line: &str) -> Result<TreeEntry> {
    let unexpected = |detail: String| ToolchainError::UnexpectedOutput {
        describe: describe.to_string(),
        detail,
    };

    let mut parts = line.splitn(3, ' ');
    let (kind, id, path) = match (parts.next(), parts.next(), parts.next()) {
        (Some(kind), Some(id), Some(path)) => (kind, id, path),
        _ => return Err(unexpected(format!("malformed listing line: {:?}", line))),
    };
    let kind: ObjectKind = kind
        .parse()
        .map_err(|e: String| unexpected(e))?;
    let kind = match kind {
        ObjectKind::Commit => ObjectKind::Submodule,
        k => k,
    };
    let id = ObjectId::from_hex(id)
        .map_err(|_| unexpected(format!("not an object id: {:?}", id)))?;
    if path.is_empty() {
        return Err(unexpected("empty path in listing".to_string()));
    }
    Ok(TreeEntry::new(path, kind, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn make_stub(dir: &Path, script: &str) -> GitToolchain {
        let path = dir.join("git-stub");
        fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        GitToolchain::new(Some(path))
    }

    #[test]
    fn test_missing_binary() {
        let git = GitToolchain::new(Some(PathBuf::from("/nonexistent/definitely-not-git")));
        let err = git.version().unwrap_err();
        assert!(matches!(err, ToolchainError::GitNotFound(_)));
    }

    #[test]
    fn test_stdout_captured_and_trimmed() {
        let tmp = TempDir::new().unwrap();
        let git = make_stub(tmp.path(), "#!/bin/sh\necho 'git version 2.44.0'\n");
        assert_eq!(git.version().unwrap(), "git version 2.44.0");
    }

    #[test]
    fn test_nonzero_exit_reports_stderr() {
        let tmp = TempDir::new().unwrap();
        let git = make_stub(tmp.path(), "#!/bin/sh\necho 'boom' >&2\nexit 3\n");
        let err = git.version().unwrap_err();
        match err {
            ToolchainError::Failed { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected Failed, got: {:?}", other),
        }
    }

    #[test]
    fn test_stdin_reaches_child() {
        let tmp = TempDir::new().unwrap();
        // Echoes stdin back, so pack_objects returns the object list itself.
        let git = make_stub(tmp.path(), "#!/bin/sh\ncat\n");
        let id = ObjectId::new([7u8; 20]);
        let pack = git.pack_objects(&[id]).unwrap();
        assert_eq!(pack, format!("{}\n", id.to_hex()).into_bytes());
    }

    #[test]
    fn test_merge_bases_exit_one_is_empty() {
        let tmp = TempDir::new().unwrap();
        let git = make_stub(tmp.path(), "#!/bin/sh\nexit 1\n");
        let bases = git.merge_bases(&[ObjectId::new([1u8; 20])]).unwrap();
        assert!(bases.is_empty());
    }

    #[test]
    fn test_parse_tree_listing() {
        let blob = "a".repeat(40);
        let sub = "b".repeat(40);
        let out = format!(
            "blob {} src/main.rs\0commit {} vendor/dep\0",
            blob, sub
        );
        let entries = parse_tree_listing("test", out.as_bytes()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, ObjectKind::Blob);
        assert_eq!(entries[0].path, "src/main.rs");
        // A commit entry inside a tree is a submodule reference.
        assert_eq!(entries[1].kind, ObjectKind::Submodule);
    }

    #[test]
    fn test_parse_tree_listing_rejects_garbage() {
        assert!(parse_tree_listing("test", b"blob deadbeef\0").is_err());
        assert!(parse_tree_listing("test", b"tag 1234 path\0").is_err());
        let short = format!("blob {} x", "a".repeat(39));
        assert!(parse_tree_listing("test", short.as_bytes()).is_err());
    }
}
