//! Calling tools, reading resources and rendering prompts.

use super::{parse_pairs, Invocation};
use anyhow::{bail, Context};
use mcplink_client::Content;
use serde_json::Value;

/// Parse `--args`; it must be a JSON object.
fn parse_arguments(raw: Option<&str>) -> anyhow::Result<Option<Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw).context("--args is not valid JSON")?;
    if !value.is_object() {
        bail!("--args must be a JSON object");
    }
    Ok(Some(value))
}

fn print_content(content: &[Content]) {
    for item in content {
        match item {
            Content::Text { text } => println!("{text}"),
            other => match serde_json::to_string(other) {
                Ok(json) => println!("{json}"),
                Err(_) => println!("[non-text content]"),
            },
        }
    }
}

/// Call a tool and print what it returned.
pub async fn call_tool(
    invocation: Invocation,
    name: &str,
    args: Option<&str>,
) -> anyhow::Result<()> {
    let arguments = parse_arguments(args)?;
    let json = invocation.json;
    let session = invocation.open().await?;
    let result = session.connection.call_tool(name, arguments).await;
    session.close().await;
    let result = result.with_context(|| format!("Tool '{name}' failed"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_content(&result.content);
    }
    if result.is_error {
        bail!("Tool '{name}' reported an error");
    }
    Ok(())
}

/// Read a resource and print its contents.
pub async fn read_resource(invocation: Invocation, uri: &str) -> anyhow::Result<()> {
    let json = invocation.json;
    let session = invocation.open().await?;
    let result = session.connection.read_resource(uri).await;
    session.close().await;
    let result = result.with_context(|| format!("Failed to read {uri}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    for contents in &result.contents {
        match (&contents.text, &contents.blob) {
            (Some(text), _) => println!("{text}"),
            (None, Some(blob)) => println!(
                "[{} bytes of base64 {}]",
                blob.len(),
                contents.mime_type.as_deref().unwrap_or("data")
            ),
            (None, None) => println!("[empty]"),
        }
    }
    Ok(())
}

/// Render a prompt with `KEY=VALUE` arguments.
pub async fn get_prompt(invocation: Invocation, name: &str, args: &[String]) -> anyhow::Result<()> {
    let arguments = parse_pairs(args, "prompt argument")?;
    let arguments = (!arguments.is_empty()).then_some(arguments);
    let json = invocation.json;
    let session = invocation.open().await?;
    let result = session.connection.get_prompt(name, arguments).await;
    session.close().await;
    let result = result.with_context(|| format!("Prompt '{name}' failed"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    if let Some(description) = &result.description {
        println!("# {description}");
        println!();
    }
    for message in &result.messages {
        println!("[{}]", message.role);
        print_content(std::slice::from_ref(&message.content));
        println!();
    }
    Ok(())
}
