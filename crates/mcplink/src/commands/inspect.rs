//! Listing what a server offers.

use super::Invocation;
use mcplink_client::{LogLevel, SessionSnapshot};

/// Shorten `text` to `width` characters.
fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() > width {
        let cut: String = text.chars().take(width.saturating_sub(3)).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

fn first_line(text: Option<&str>) -> &str {
    text.and_then(|t| t.lines().next()).unwrap_or("")
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Connect and print the session summary.
pub async fn show_status(invocation: Invocation) -> anyhow::Result<()> {
    let json = invocation.json;
    let session = invocation.open().await?;
    let snapshot = session.connection.snapshot();
    session.close().await;

    if json {
        return print_json(&snapshot);
    }
    print_status(&snapshot);
    Ok(())
}

fn print_status(snapshot: &SessionSnapshot) {
    println!("State:      {}", snapshot.state);
    if let Some(transport) = snapshot.transport {
        println!("Transport:  {}", transport.label());
    }
    println!("Tools:      {}", snapshot.tools.len());
    println!(
        "Resources:  {} ({} templates)",
        snapshot.resources.len(),
        snapshot.resource_templates.len()
    );
    println!("Prompts:    {}", snapshot.prompts.len());
    println!();
    println!("Log:");
    for entry in &snapshot.log {
        let level = match entry.level {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info ",
            LogLevel::Warn => "warn ",
            LogLevel::Error => "error",
        };
        println!(
            "  {} {level} {}",
            entry.timestamp.format("%H:%M:%S%.3f"),
            entry.message
        );
    }
}

/// Print the tools the server offers.
pub async fn list_tools(invocation: Invocation) -> anyhow::Result<()> {
    let json = invocation.json;
    let session = invocation.open().await?;
    let tools = session.connection.snapshot().tools;
    session.close().await;

    if json {
        return print_json(&tools);
    }
    if tools.is_empty() {
        println!("No tools.");
        return Ok(());
    }
    println!("{:<30} {}", "NAME", "DESCRIPTION");
    println!("{}", "-".repeat(80));
    for tool in &tools {
        println!(
            "{:<30} {}",
            truncate(&tool.name, 30),
            truncate(first_line(tool.description.as_deref()), 49)
        );
    }
    Ok(())
}

/// Print resources and resource templates.
pub async fn list_resources(invocation: Invocation) -> anyhow::Result<()> {
    let json = invocation.json;
    let session = invocation.open().await?;
    let result = session.connection.list_resources().await;
    let templates = session.connection.snapshot().resource_templates;
    session.close().await;
    let resources = result?;

    if json {
        return print_json(&serde_json::json!({
            "resources": resources,
            "resourceTemplates": templates,
        }));
    }
    if resources.is_empty() && templates.is_empty() {
        println!("No resources.");
        return Ok(());
    }
    println!("{:<40} {:<20} {}", "URI", "NAME", "TYPE");
    println!("{}", "-".repeat(80));
    for resource in &resources {
        println!(
            "{:<40} {:<20} {}",
            truncate(&resource.uri, 40),
            truncate(&resource.name, 20),
            resource.mime_type.as_deref().unwrap_or("")
        );
    }
    for template in &templates {
        println!(
            "{:<40} {:<20} {}",
            truncate(&template.uri_template, 40),
            truncate(&template.name, 20),
            "template"
        );
    }
    Ok(())
}

/// Print prompts and their arguments.
pub async fn list_prompts(invocation: Invocation) -> anyhow::Result<()> {
    let json = invocation.json;
    let session = invocation.open().await?;
    let result = session.connection.list_prompts().await;
    session.close().await;
    let prompts = result?;

    if json {
        return print_json(&prompts);
    }
    if prompts.is_empty() {
        println!("No prompts.");
        return Ok(());
    }
    for prompt in &prompts {
        println!("{}", prompt.name);
        let description = first_line(prompt.description.as_deref());
        if !description.is_empty() {
            println!("  {description}");
        }
        for argument in &prompt.arguments {
            let marker = if argument.required { " (required)" } else { "" };
            println!("  --arg {}=...{marker}", argument.name);
        }
    }
    Ok(())
}
