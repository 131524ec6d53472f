//! Environment-script generation for task worktrees.
//!
//! Writes `.delegate/setup.sh` and `.delegate/premerge.sh` into a fresh
//! worktree when absent. The merge worker sources setup then premerge
//! before fast-forwarding, so env mutations (activated virtualenvs,
//! PATH exports) carry into the test run.

use std::path::Path;

use delegate_core::error::Result;

const SCRIPT_HEADER: &str = "#!/usr/bin/env bash\nset -e\n# Auto-generated by delegate at worktree creation. Edit as needed.\n";

struct DetectedStack {
    label: &'static str,
    setup: String,
    premerge: String,
}

/// Stack detection for the common ecosystems at the worktree root.
fn detect_stacks(root: &Path) -> Vec<DetectedStack> {
    let mut stacks = Vec::new();

    if root.join("pyproject.toml").exists() || root.join("requirements.txt").exists() {
        let setup = if root.join("pyproject.toml").exists() {
            "python -m venv .venv && . .venv/bin/activate && pip install -e \".[dev]\""
        } else {
            "python -m venv .venv && . .venv/bin/activate && pip install -r requirements.txt"
        };
        stacks.push(DetectedStack {
            label: "Python",
            setup: setup.to_string(),
            premerge: "pytest".to_string(),
        });
    }

    if root.join("package.json").exists() {
        let premerge = if has_npm_test_script(root) {
            "npm test"
        } else {
            "echo 'No tests configured'"
        };
        stacks.push(DetectedStack {
            label: "Node",
            setup: "npm ci && export PATH=\"$PWD/node_modules/.bin:$PATH\"".to_string(),
            premerge: premerge.to_string(),
        });
    }

    if root.join("Cargo.toml").exists() {
        stacks.push(DetectedStack {
            label: "Rust",
            setup: "cargo build".to_string(),
            premerge: "cargo test".to_string(),
        });
    }

    if root.join("go.mod").exists() {
        stacks.push(DetectedStack {
            label: "Go",
            setup: "go mod tidy".to_string(),
            premerge: "go test ./...".to_string(),
        });
    }

    stacks
}

fn has_npm_test_script(root: &Path) -> bool {
    let Ok(text) = std::fs::read_to_string(root.join("package.json")) else {
        return false;
    };
    serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|pkg| pkg.get("scripts")?.get("test").cloned())
        .is_some()
}

fn script_body(stacks: &[DetectedStack], premerge: bool) -> String {
    if stacks.is_empty() {
        return "# No stack detected. Fill in commands for this repo.\n".to_string();
    }
    let parts: Vec<String> = stacks
        .iter()
        .map(|s| {
            let cmd = if premerge { &s.premerge } else { &s.setup };
            format!("# {}\n{}", s.label, cmd)
        })
        .collect();
    format!("{}\n", parts.join("\n\n"))
}

/// Generate both scripts under `<worktree>/.delegate/` if absent.
/// Returns true when the scripts were written.
pub fn generate_env_scripts(worktree: &Path) -> Result<bool> {
    let script_dir = worktree.join(".delegate");
    let setup_path = script_dir.join("setup.sh");
    let premerge_path = script_dir.join("premerge.sh");

    if setup_path.exists() {
        tracing::info!(
            "env scripts already exist in {} — skipping generation",
            worktree.display()
        );
        return Ok(false);
    }

    let stacks = detect_stacks(worktree);
    std::fs::create_dir_all(&script_dir)?;
    std::fs::write(
        &setup_path,
        format!("{SCRIPT_HEADER}\n{}", script_body(&stacks, false)),
    )?;
    std::fs::write(
        &premerge_path,
        format!("{SCRIPT_HEADER}\n{}", script_body(&stacks, true)),
    )?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for path in [&setup_path, &premerge_path] {
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(path, perms)?;
        }
    }

    tracing::info!("wrote env scripts under {}", script_dir.display());
    Ok(true)
}
