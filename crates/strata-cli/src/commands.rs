use std::fs::File;
use std::io::{self, BufWriter, Read, Write};

use anyhow::Context;
use colored::Colorize;
use serde::Serialize;
use serde_json::json;
use strata_store::{ElementStore, StoreConfig};
use strata_types::{validate_extension, Source};
use tracing::warn;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let open = || ElementStore::from_config(&config).context("cannot open element store");
    let format = &cli.format;
    match cli.command {
        Command::Put(args) => cmd_put(&open()?, args, format),
        Command::Get(args) => cmd_get(&open()?, args, format),
        Command::Copy(args) => cmd_copy(&open()?, args, format),
        Command::Contains(args) => cmd_contains(&open()?, args, format),
        Command::Delete(args) => cmd_delete(&open()?, args, format),
        Command::Space => cmd_space(&open()?, format),
        Command::Key(args) => cmd_key(&open()?, args, format),
        Command::StorageClass(args) => cmd_storage_class(&open()?, args, format),
        Command::Restore(args) => cmd_restore(&open()?, args, format),
        Command::Compact => cmd_compact(&config, format),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let config = if cli.config.exists() {
        StoreConfig::from_file(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "config file not found, using defaults");
        StoreConfig::default()
    };
    if config.mapping.journal.is_none() {
        warn!("no mapping journal configured; mappings are lost when the command exits");
    }
    Ok(config)
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_put(store: &ElementStore, args: PutArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let mapping = if args.source == "-" {
        let extension = args.extension.as_deref().or(args.path.extension());
        if let Some(ext) = extension {
            validate_extension(ext)?;
        }
        let mut stdin = io::stdin().lock();
        store.put_reader(&args.path, &mut stdin, extension, args.mime_type.as_ref())?
    } else {
        let mut source = Source::parse(&args.source)?;
        if let Some(ext) = args.extension {
            source = source.with_extension(ext)?;
        }
        if let Some(mime) = args.mime_type {
            source = source.with_mime_type(mime);
        }
        store.put(&args.path, &source)?
    };
    match format {
        OutputFormat::Json => print_json(&mapping),
        OutputFormat::Text => {
            println!("{} Stored {}", "✓".green().bold(), mapping.storage_path.to_string().bold());
            println!("  Object: {}", mapping.locator().to_string().cyan());
            Ok(())
        }
    }
}

fn cmd_get(store: &ElementStore, args: GetArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let Some(mut data) = store.get(&args.path)? else {
        anyhow::bail!("{} is not stored", args.path);
    };
    let written = match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            copy_out(&mut data, &mut BufWriter::new(file))?
        }
        None => return copy_out(&mut data, &mut io::stdout().lock()).map(|_| ()),
    };
    match format {
        OutputFormat::Json => print_json(&json!({ "path": args.path.to_string(), "bytes": written })),
        OutputFormat::Text => {
            println!("{} Wrote {} bytes of {}", "✓".green().bold(), written, args.path.to_string().bold());
            Ok(())
        }
    }
}

fn copy_out(data: &mut dyn Read, out: &mut dyn Write) -> anyhow::Result<u64> {
    let written = io::copy(data, out)?;
    out.flush()?;
    Ok(written)
}

fn cmd_copy(store: &ElementStore, args: CopyArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let copied = store.copy(&args.from, &args.to)?;
    match format {
        OutputFormat::Json => print_json(&json!({
            "from": args.from.to_string(),
            "to": args.to.to_string(),
            "copied": copied,
        })),
        OutputFormat::Text if copied => {
            println!("{} {} → {}", "✓".green().bold(), args.from.to_string().bold(), args.to.to_string().bold());
            Ok(())
        }
        OutputFormat::Text => {
            println!("{} {} is not stored; nothing copied", "✗".red(), args.from.to_string().bold());
            Ok(())
        }
    }
}

fn cmd_contains(store: &ElementStore, args: PathArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let stored = store.contains(&args.path)?;
    match format {
        OutputFormat::Json => print_json(&json!({ "path": args.path.to_string(), "stored": stored })),
        OutputFormat::Text if stored => {
            println!("{} {}", "stored".green(), args.path);
            Ok(())
        }
        OutputFormat::Text => {
            println!("{} {}", "absent".yellow(), args.path);
            Ok(())
        }
    }
}

fn cmd_delete(store: &ElementStore, args: DeleteArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let report = store.delete(&args.selector)?;
    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => {
            println!(
                "Deleted {}: {} paths released, {} objects reclaimed",
                args.selector.to_string().bold(),
                report.released.len().to_string().bold(),
                report.reclaimed.len().to_string().bold(),
            );
            for failure in &report.failures {
                println!("  {} {}: {}", "✗".red(), failure.locator.to_string().yellow(), failure.reason);
            }
        }
    }
    if !report.is_complete() {
        anyhow::bail!("{} objects could not be removed", report.failures.len());
    }
    Ok(())
}

fn cmd_space(store: &ElementStore, format: &OutputFormat) -> anyhow::Result<()> {
    let (used, usable, total) = (store.used_space(), store.usable_space(), store.total_space());
    match format {
        OutputFormat::Json => print_json(&json!({
            "backend": store.backend().name(),
            "used": used,
            "usable": usable,
            "total": total,
        })),
        OutputFormat::Text => {
            let show = |v: Option<u64>| v.map_or_else(|| "unknown".dimmed().to_string(), |v| v.to_string());
            println!("Backend: {}", store.backend().name().bold());
            println!("  Used:   {}", show(used));
            println!("  Usable: {}", show(usable));
            println!("  Total:  {}", show(total));
            Ok(())
        }
    }
}

fn cmd_key(store: &ElementStore, args: PathArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let Some(key) = store.object_key(&args.path)? else {
        anyhow::bail!("{} is not stored", args.path);
    };
    match format {
        OutputFormat::Json => print_json(&json!({ "path": args.path.to_string(), "key": key })),
        OutputFormat::Text => {
            println!("{}", key.to_string().cyan());
            Ok(())
        }
    }
}

fn cmd_storage_class(
    store: &ElementStore,
    args: StorageClassArgs,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let class = match &args.set {
        Some(target) => store.modify_storage_class(&args.path, target.clone())?,
        None => store.storage_class(&args.path)?,
    };
    let Some(class) = class else {
        anyhow::bail!("{} is not stored", args.path);
    };
    if let Some(target) = args.set.as_ref().filter(|t| **t != class) {
        warn!(path = %args.path, %target, current = %class, "storage class change refused");
    }
    match format {
        OutputFormat::Json => print_json(&json!({ "path": args.path.to_string(), "storage_class": class })),
        OutputFormat::Text => {
            println!("{} {}", args.path, class.to_string().cyan().bold());
            Ok(())
        }
    }
}

fn cmd_restore(store: &ElementStore, args: RestoreArgs, format: &OutputFormat) -> anyhow::Result<()> {
    if !args.status && !store.initiate_restore(&args.path, args.days)? {
        anyhow::bail!("{} is not stored", args.path);
    }
    let Some(status) = store.restore_status(&args.path)? else {
        anyhow::bail!("{} is not stored", args.path);
    };
    match format {
        OutputFormat::Json => print_json(&json!({ "path": args.path.to_string(), "restore": status })),
        OutputFormat::Text => {
            println!("{} {}", args.path, status.to_string().yellow());
            Ok(())
        }
    }
}

fn cmd_compact(config: &StoreConfig, format: &OutputFormat) -> anyhow::Result<()> {
    let table = config.open_mapping()?;
    table.compact()?;
    let (active, total) = (table.active_rows()?, table.total_rows()?);
    match format {
        OutputFormat::Json => print_json(&json!({
            "durable": table.is_durable(),
            "active_rows": active,
            "total_rows": total,
        })),
        OutputFormat::Text => {
            println!("{} Mapping journal compacted", "✓".green().bold());
            println!("  Rows: {} active, {} total", active.to_string().bold(), total);
            Ok(())
        }
    }
}
