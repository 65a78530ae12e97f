//! A complete example showing how to build and run a flow with Tessera.
//!
//! This example demonstrates:
//! - Registering a callback and calling it from a node
//! - Passing results between nodes with `$hier{}` templates
//! - Branching with a conditional and iterating with a for-each
//! - Inspecting the recorded run directory
//!
//! Run it with `cargo run --example basic_flow`.

use serde_json::json;
use tessera::CallbackArgs;
use tessera::prelude::*;

// ============================================================================
// Step 1: Callbacks
// ============================================================================

/// Normalizes a user name, falling back to "Guest".
fn validate_name(args: CallbackArgs) -> Result<NodeValue, tessera::CallbackError> {
    let name = args
        .get("name")
        .and_then(NodeValue::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("Guest");
    Ok(json!({ "name": name, "is_guest": name == "Guest" }))
}

// ============================================================================
// Step 2: The Flow
// ============================================================================

fn greeting_flow() -> Result<ComponentDefinition, FlowError> {
    let welcome_back = ComponentDefinition::flow()
        .node(
            "greet",
            NodeDefinition::new(CommandSettings::new([
                "echo 'Welcome back, $hier{validate}.outcome.name!'",
            ])),
        )
        .build()?;
    let welcome_guest = ComponentDefinition::flow()
        .node("greet", NodeDefinition::new(CommandSettings::new(["echo 'Hello, stranger!'"])))
        .build()?;
    let per_topic = ComponentDefinition::flow()
        .node(
            "mention",
            NodeDefinition::new(CommandSettings::new(["echo 'Topic $var{index}: $var{item}'"])),
        )
        .build()?;

    ComponentDefinition::flow()
        .description("Greets a user and lists their topics")
        .node(
            "validate",
            NodeDefinition::new(CallbackSettings::new("validate_name").template_arg("name", "$var{user_name}")),
        )
        .conditional(
            "welcome",
            Conditional::new("$hier{validate}.outcome.is_guest == false", welcome_back).otherwise(welcome_guest),
        )
        .for_each("topics", ForEach::new("$var{topics}", per_topic).max_iterations(5))
        .build()
}

// ============================================================================
// Step 3: Running It
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), FlowError> {
    let root = std::env::temp_dir().join("tessera-demo");
    let mut config = RunConfig {
        root_dir: root,
        project_name: "demo".into(),
        ..RunConfig::default()
    };
    config.static_variables.insert("user_name".into(), json!("Ada"));
    config
        .static_variables
        .insert("topics".into(), json!(["compilers", "engines", "notes"]));

    let mut callbacks = CallbackRegistry::new();
    callbacks.register_fn("validate_name", validate_name);

    let run = RunContextBuilder::new(config)
        .with_callbacks(callbacks)
        .build("greeting")?;
    let runner = Runner::new(greeting_flow()?, run)?;
    let result = runner.run().await?;

    println!("Run {} finished: {:?}", runner.run_context().run_id, result.execution_status);
    for (id, element) in result.ordered() {
        println!("  {id}: {:?} -> {}", element.status(), element.outcome());
    }
    println!("Artifacts in {}", runner.run_context().run_dir.display());
    Ok(())
}
