//! taskflow init command implementation
//!
//! Writes a default `.taskflow.toml` and creates the state directory.

use std::path::PathBuf;

use crate::config::{Config, CONFIG_FILE_NAME};
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};
use crate::storage::{ensure_gitignore, Storage};

use super::Context;

#[derive(serde::Serialize)]
struct InitReport {
    root: PathBuf,
    created: InitCreated,
    updated: InitUpdated,
}

#[derive(serde::Serialize)]
struct InitCreated {
    config: bool,
    state_dir: bool,
}

#[derive(serde::Serialize)]
struct InitUpdated {
    gitignore: bool,
}

pub fn run(context: &Context) -> Result<()> {
    let root = &context.root;
    let config_path = root.join(CONFIG_FILE_NAME);
    let created_config = if config_path.exists() {
        false
    } else {
        Config::default().save(&config_path)?;
        true
    };

    let config = Config::load_from_root(root)?;
    let storage = Storage::new(root.clone(), &config.index)?;
    let created_state_dir = !storage.state_dir().exists();
    storage.init()?;

    let updated_gitignore = if root.join(".git").exists() {
        let before = std::fs::read_to_string(root.join(".gitignore")).unwrap_or_default();
        ensure_gitignore(root, &config.index.state_dir)?;
        let after = std::fs::read_to_string(root.join(".gitignore")).unwrap_or_default();
        before != after
    } else {
        false
    };

    let report = InitReport {
        root: root.clone(),
        created: InitCreated {
            config: created_config,
            state_dir: created_state_dir,
        },
        updated: InitUpdated {
            gitignore: updated_gitignore,
        },
    };

    let mut created_items = Vec::new();
    if created_config {
        created_items.push(CONFIG_FILE_NAME.to_string());
    }
    if created_state_dir {
        created_items.push(format!("{}/", config.index.state_dir));
    }

    let header = if created_items.is_empty() && !updated_gitignore {
        "taskflow init: nothing to do".to_string()
    } else {
        "taskflow init: initialized corpus".to_string()
    };

    let mut human = HumanOutput::new(header);
    human.push_summary("root", root.display().to_string());
    human.push_summary(
        "created",
        if created_items.is_empty() {
            "none".to_string()
        } else {
            created_items.join(", ")
        },
    );
    if updated_gitignore {
        human.push_summary("updated", ".gitignore");
    }
    human.push_next_step("taskflow scan");

    emit_success(context.output, "init", &report, Some(&human))
}
