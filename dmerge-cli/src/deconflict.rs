//! Merge/rebase workflow against the deconfliction service.
//!
//! Builds the divergence pack for a main/topic pair, uploads it, and
//! applies the server's streamed instructions: creating refs, relaying
//! stdout/stderr, honoring exit directives, and importing binary packs.

use anyhow::{anyhow, bail, Result};
use dmerge_core::{
    divergence_pack, Client, ClientIdentity, ControlMessage, DeconflictRequest, GitToolchain,
    ObjectId, ResponseMessage, ResponseStream, Toolchain,
};
use std::io::Write;

use crate::config::{self, Config, SERVER_KEY, TOKEN_KEY};

/// Build the toolchain adapter, honoring a configured binary override.
pub fn make_toolchain(cfg: &Config) -> GitToolchain {
    GitToolchain::new(config::git_override(cfg))
}

/// Build the service client with identity metadata from the local toolchain.
pub fn make_client(cfg: &Config, git: &GitToolchain) -> Client {
    let git_version = git.version().unwrap_or_default(); // best effort
    Client::new(
        cfg.get(SERVER_KEY),
        cfg.get(TOKEN_KEY),
        ClientIdentity {
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_version,
        },
    )
}

/// Run the full deconflict workflow for `verb` ("merge" or "rebase").
pub async fn run(
    cfg: &Config,
    verb: &str,
    main_arg: Option<String>,
    topic_arg: Option<String>,
) -> Result<()> {
    let git = make_toolchain(cfg);
    require_clean_status(&git)?;

    let (main_ref, topic_ref) = main_topic(&git, verb, main_arg, topic_arg)?;
    match verb {
        "rebase" => println!("plan: rebase {} onto {}", topic_ref, main_ref),
        _ => println!("plan: merge {} into {}", main_ref, topic_ref),
    }

    let main_sha = git.resolve_ref(&main_ref)?;
    let topic_sha = git.resolve_ref(&topic_ref)?;

    println!("analyzing...");
    let pack = divergence_pack(&git, main_sha, topic_sha)?;
    let remotes = git.remotes().unwrap_or_default(); // best effort

    let client = make_client(cfg, &git);
    println!("uploading {}...", format_size(pack.len() as u64));
    let mut stream = client
        .deconflict(
            verb,
            DeconflictRequest {
                main_ref,
                topic_ref,
                main_sha,
                topic_sha,
                remotes,
                pack,
            },
        )
        .await?;
    drain(&git, &mut stream, true).await
}

/// Apply every streamed message in arrival order. Binary payloads are
/// imported into the local store when `unpack` is set, ignored otherwise.
pub async fn drain(git: &GitToolchain, stream: &mut ResponseStream, unpack: bool) -> Result<()> {
    while let Some(msg) = stream.next().await {
        match msg? {
            ResponseMessage::Control(ctl) => apply_control(git, &ctl)?,
            ResponseMessage::Binary(data) => {
                if unpack {
                    git.unpack_objects(&data)?;
                }
            }
        }
    }
    Ok(())
}

fn apply_control(git: &GitToolchain, ctl: &ControlMessage) -> Result<()> {
    if let Some((ref_name, sha)) = ctl.ref_update() {
        let id = ObjectId::from_hex(sha).map_err(|_| {
            anyhow!("server sent invalid object id {:?} for ref {}", sha, ref_name)
        })?;
        git.create_ref(ref_name, id)?;
    }
    if !ctl.stdout.is_empty() {
        print!("{}", ctl.stdout);
    }
    if !ctl.stderr.is_empty() {
        eprint!("{}", ctl.stderr);
    }
    if ctl.exit_code > 0 {
        let _ = std::io::stdout().flush();
        std::process::exit(ctl.exit_code);
    }
    Ok(())
}

/// Refuse to start while another history-rewriting operation is underway.
fn require_clean_status(git: &GitToolchain) -> Result<()> {
    let git_dir = git.git_dir()?;
    let files_reason = [
        ("MERGE_HEAD", "merge is in progress"),
        ("REBASE_HEAD", "rebase is in progress"),
        ("CHERRY_PICK_HEAD", "cherry-pick is in progress"),
        ("REVERT_HEAD", "revert is in progress"),
    ];
    for (file, reason) in files_reason {
        if git_dir.join(file).exists() {
            bail!("cannot proceed: {}", reason);
        }
    }
    Ok(())
}

/// Resolve the main and topic refs from explicit arguments, falling back
/// to the current branch and its upstream.
fn main_topic(
    git: &GitToolchain,
    verb: &str,
    main_arg: Option<String>,
    topic_arg: Option<String>,
) -> Result<(String, String)> {
    let topic_ref = match topic_arg {
        Some(topic) => topic,
        None => git.abbrev_ref("HEAD")?,
    };
    let main_ref = match main_arg {
        Some(main) => main,
        None => {
            if !git.has_upstream(&topic_ref)? {
                bail!(
                    "no upstream set for {}, please explicitly specify a main branch: dmerge {} <main>",
                    topic_ref,
                    verb
                );
            }
            git.abbrev_ref(&format!("{}@{{upstream}}", topic_ref))?
        }
    };
    Ok((main_ref, topic_ref))
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
