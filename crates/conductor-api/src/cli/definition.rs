//! Definition management commands.
//!
//! Provides `conductor definition` subcommands: create, import, update,
//! publish, deprecate, unpublish, list, versions, show, validate, dry-run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use conductor_core::workflow::definition::{load_dsl_file, parse_dsl, serialize_dsl_yaml};
use conductor_types::definition::{VersionStatus, WorkflowDefinitionVersion};
use conductor_types::dsl::WorkflowDsl;

use crate::state::AppState;

use super::{format_time, parse_json_arg};

#[derive(Subcommand)]
pub enum DefinitionCommand {
    /// Register a new workflow definition code.
    Create {
        /// Unique code (letters, digits, `-`, `_`, `.`).
        code: String,

        /// Display name (defaults to the code).
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },

    /// Add a Draft version from a YAML or JSON file.
    Import {
        code: String,

        /// Path to the DSL file.
        file: PathBuf,

        #[arg(long)]
        changelog: Option<String>,

        /// Publish the new version right away.
        #[arg(long)]
        publish: bool,
    },

    /// Replace the DSL of a Draft version.
    Update {
        code: String,
        version: u32,
        file: PathBuf,
    },

    /// Validate and publish a version.
    Publish { code: String, version: u32 },

    /// Stop new runs from using a version.
    Deprecate { code: String, version: u32 },

    /// Return a Published version to Draft (only if no run uses it).
    Unpublish { code: String, version: u32 },

    /// List all definitions.
    #[command(alias = "ls")]
    List,

    /// List the versions of a definition.
    Versions { code: String },

    /// Show one version and its DSL (latest when no version is given).
    Show {
        code: String,

        #[arg(long)]
        version: Option<u32>,
    },

    /// Validate a DSL file without storing it.
    Validate { file: PathBuf },

    /// Walk a version's graph with a sample input, executing nothing.
    #[command(name = "dry-run")]
    DryRun {
        code: String,

        #[arg(long)]
        version: Option<u32>,

        /// Input context as a JSON object.
        #[arg(long)]
        input: Option<String>,
    },
}

/// Dispatch a definition subcommand.
pub async fn handle_definition_command(
    cmd: DefinitionCommand,
    state: &AppState,
    actor: &str,
    json: bool,
) -> Result<()> {
    match cmd {
        DefinitionCommand::Create {
            code,
            name,
            description,
        } => handle_create(state, &code, name.as_deref(), description, actor, json).await,
        DefinitionCommand::Import {
            code,
            file,
            changelog,
            publish,
        } => handle_import(state, &code, &file, changelog, publish, actor, json).await,
        DefinitionCommand::Update {
            code,
            version,
            file,
        } => {
            let dsl = read_dsl(&file).await?;
            let updated = state.definitions.update_draft(&code, version, dsl, actor).await?;
            print_version_change(&updated, "Updated", json)
        }
        DefinitionCommand::Publish { code, version } => {
            let published = state.definitions.publish(&code, version, actor).await?;
            print_version_change(&published, "Published", json)
        }
        DefinitionCommand::Deprecate { code, version } => {
            let deprecated = state.definitions.deprecate(&code, version, actor).await?;
            print_version_change(&deprecated, "Deprecated", json)
        }
        DefinitionCommand::Unpublish { code, version } => {
            let draft = state.definitions.unpublish(&code, version, actor).await?;
            print_version_change(&draft, "Unpublished", json)
        }
        DefinitionCommand::List => handle_list(state, json).await,
        DefinitionCommand::Versions { code } => handle_versions(state, &code, json).await,
        DefinitionCommand::Show { code, version } => handle_show(state, &code, version, json).await,
        DefinitionCommand::Validate { file } => handle_validate(&file, json),
        DefinitionCommand::DryRun {
            code,
            version,
            input,
        } => handle_dry_run(state, &code, version, input.as_deref(), json).await,
    }
}

/// Read a DSL file without validating it; drafts may be incomplete.
async fn read_dsl(path: &Path) -> Result<WorkflowDsl> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_dsl(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn print_version_change(version: &WorkflowDefinitionVersion, verb: &str, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(version)?);
        return Ok(());
    }
    println!();
    println!(
        "  {} {} {} v{} ({})",
        style("✓").green().bold(),
        verb,
        style(&version.definition_code).cyan(),
        version.version_number,
        version.status
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Create / Import
// ---------------------------------------------------------------------------

async fn handle_create(
    state: &AppState,
    code: &str,
    name: Option<&str>,
    description: Option<String>,
    actor: &str,
    json: bool,
) -> Result<()> {
    let definition = state
        .definitions
        .create_definition(code, name.unwrap_or(code), description, actor)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&definition)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Created definition {}",
        style("✓").green().bold(),
        style(&definition.code).cyan()
    );
    println!(
        "  Add a version with: {}",
        style(format!("conductor definition import {} <file.yaml>", definition.code)).dim()
    );
    println!();
    Ok(())
}

async fn handle_import(
    state: &AppState,
    code: &str,
    file: &Path,
    changelog: Option<String>,
    publish: bool,
    actor: &str,
    json: bool,
) -> Result<()> {
    let dsl = read_dsl(file).await?;
    let mut version = state
        .definitions
        .create_version(code, dsl, changelog, actor)
        .await?;
    if publish {
        version = state
            .definitions
            .publish(code, version.version_number, actor)
            .await?;
    }
    print_version_change(&version, "Imported", json)
}

// ---------------------------------------------------------------------------
// List / Versions / Show
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let definitions = state.definitions.list_definitions().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&definitions)?);
        return Ok(());
    }

    if definitions.is_empty() {
        println!();
        println!("  No workflow definitions.");
        println!(
            "  Create one with: {}",
            style("conductor definition create <code>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Code").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Description"),
            Cell::new("Updated"),
        ]);

    for d in &definitions {
        table.add_row(vec![
            Cell::new(&d.code),
            Cell::new(&d.name),
            Cell::new(d.description.as_deref().unwrap_or("-")),
            Cell::new(format_time(Some(d.updated_at))),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn version_status_cell(status: VersionStatus) -> Cell {
    let color = match status {
        VersionStatus::Draft => Color::Yellow,
        VersionStatus::Published => Color::Green,
        VersionStatus::Deprecated => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}

async fn handle_versions(state: &AppState, code: &str, json: bool) -> Result<()> {
    let versions = state.definitions.list_versions(code).await?;

    if json {
        let out: Vec<_> = versions
            .iter()
            .map(|v| {
                serde_json::json!({
                    "version": v.version_number,
                    "status": v.status,
                    "steps": v.dsl.steps.len(),
                    "changelog": v.changelog,
                    "published_at": v.published_at.map(|t| t.to_rfc3339()),
                    "updated_by": v.updated_by,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if versions.is_empty() {
        println!();
        println!("  No versions of '{code}'.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Version").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Steps"),
            Cell::new("Published"),
            Cell::new("Changelog"),
        ]);

    for v in &versions {
        table.add_row(vec![
            Cell::new(v.version_number),
            version_status_cell(v.status),
            Cell::new(v.dsl.steps.len()),
            Cell::new(format_time(v.published_at)),
            Cell::new(v.changelog.as_deref().unwrap_or("-")),
        ]);
    }

    println!();
    println!("  Versions of '{}'", style(code).cyan());
    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_show(state: &AppState, code: &str, version: Option<u32>, json: bool) -> Result<()> {
    let stored = state.definitions.get_version(code, version).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stored)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} v{}",
        style("Definition:").bold(),
        style(&stored.definition_code).cyan(),
        stored.version_number
    );
    println!("  Status: {}", stored.status);
    println!("  Created: {} by {}", format_time(Some(stored.created_at)), stored.created_by);
    if let Some(published) = stored.published_at {
        println!("  Published: {}", format_time(Some(published)));
    }
    if let Some(ref changelog) = stored.changelog {
        println!("  Changelog: {changelog}");
    }
    println!();
    for line in serialize_dsl_yaml(&stored.dsl)?.lines() {
        println!("    {line}");
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Validate / Dry run
// ---------------------------------------------------------------------------

fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let dsl = load_dsl_file(file)?;

    if json {
        let out = serde_json::json!({
            "valid": true,
            "start_at": dsl.start_at,
            "steps": dsl.steps.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} is valid ({} steps, starts at '{}')",
        style("✓").green().bold(),
        file.display(),
        dsl.steps.len(),
        dsl.start_at
    );
    println!();
    Ok(())
}

async fn handle_dry_run(
    state: &AppState,
    code: &str,
    version: Option<u32>,
    input: Option<&str>,
    json: bool,
) -> Result<()> {
    let input = parse_json_arg(input, "input")?;
    let report = state.definitions.dry_run(code, version, input).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} v{}",
        style("Dry run:").bold(),
        style(&report.definition_code).cyan(),
        report.version_number
    );
    println!("  Path: {}", report.path.join(" → "));
    println!("  Context: {}", serde_json::to_string(&report.context)?);
    println!();
    Ok(())
}
