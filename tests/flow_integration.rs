//! End-to-end flows run through the public API against a temporary run root.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde_json::json;
use tessera::prelude::*;
use tessera::{CallbackArgs, GitCollaborator, GitError, NodeSettings, RunContext};

fn config(root: &Path) -> RunConfig {
    RunConfig {
        root_dir: root.to_path_buf(),
        project_name: "it".into(),
        ..RunConfig::default()
    }
}

fn callbacks() -> CallbackRegistry {
    let mut callbacks = CallbackRegistry::new();
    callbacks.register_fn("echo", |args: CallbackArgs| Ok(NodeValue::Object(args)));
    callbacks
}

/// A callback node whose outcome is its rendered template arguments.
fn echo(args: &[(&str, &str)]) -> NodeDefinition {
    let settings = args
        .iter()
        .fold(CallbackSettings::new("echo"), |settings, (name, template)| {
            settings.template_arg(*name, *template)
        });
    NodeDefinition::new(settings)
}

async fn execute(
    flow: ComponentDefinition,
    builder: RunContextBuilder,
) -> (Arc<RunContext>, Result<ComponentExecutionResult, FlowError>) {
    let runner = Runner::new(flow, builder.build("main").unwrap()).unwrap();
    let result = runner.run().await;
    (Arc::clone(runner.run_context()), result)
}

#[tokio::test]
async fn test_command_fail_fast_controls_executed_commands() {
    let dir = tempfile::tempdir().unwrap();
    let commands = ["exit 0", "exit 1", "exit 0"];
    let flow = ComponentDefinition::flow()
        .node("strict", NodeDefinition::new(CommandSettings::new(commands)))
        .node(
            "lenient",
            NodeDefinition::new(CommandSettings::new(commands).fail_fast(false)),
        )
        .build()
        .unwrap();

    let (run, result) = execute(flow, RunContextBuilder::new(config(dir.path()))).await;
    let result = result.unwrap();

    // Neither node is fail_fast at the node level, so the flow runs both.
    assert_eq!(result.execution_status, ExecutionStatus::Failed);
    let strict = result.get("strict").unwrap();
    assert_eq!(strict.status(), ExecutionStatus::Failed);
    assert_eq!(strict.outcome()["commands_executed"], json!(2));
    assert_eq!(strict.outcome()["failed_commands"], json!(1));

    let lenient = result.get("lenient").unwrap();
    assert_eq!(lenient.outcome()["commands_executed"], json!(3));
    assert_eq!(lenient.outcome()["successful_commands"], json!(2));
    assert_eq!(lenient.outcome()["results"][1]["returncode"], json!(1));

    let metadata = run.read_metadata().unwrap();
    assert_eq!(metadata.status, ExecutionStatus::Failed);
    assert_eq!(metadata.failed_node.as_deref(), Some("main/strict"));
    assert_eq!(metadata.error.as_deref(), Some("1 command(s) failed"));
}

#[tokio::test]
async fn test_fail_fast_node_aborts_flow_and_marks_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let flow = ComponentDefinition::flow()
        .node("boom", NodeDefinition::new(CommandSettings::new(["exit 3"])).fail_fast(true))
        .node("after", NodeDefinition::new(CommandSettings::new(["echo never"])))
        .build()
        .unwrap();

    let (run, result) = execute(flow, RunContextBuilder::new(config(dir.path()))).await;
    match result {
        Err(FlowError::NodeFailed { node_hier, .. }) => assert_eq!(node_hier, "main/boom"),
        other => panic!("expected NodeFailed, got {other:?}"),
    }

    assert!(run.run_dir.join("main/boom/result.json").is_file());
    assert!(!run.run_dir.join("main/after").exists());
    let metadata = run.read_metadata().unwrap();
    assert_eq!(metadata.status, ExecutionStatus::Failed);
    assert_eq!(metadata.failed_node.as_deref(), Some("main/boom"));
    assert!(metadata.completed_at.is_some());
}

#[tokio::test]
async fn test_templates_reach_variables_expressions_and_previous_results() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.static_variables.insert("name".into(), json!("ada"));
    config.static_variables.insert("count".into(), json!(2));

    let flow = ComponentDefinition::flow()
        .node("produce", echo(&[("text", "hello $var{name}")]))
        .node(
            "consume",
            echo(&[
                ("previous_text", "$hier{previous}.outcome.text"),
                ("by_id", "$hier{produce}.outcome.text"),
                ("many", "$expr{count > 1}"),
                ("literal", "$$var{name}"),
                ("where", "$var{node_hier}"),
            ]),
        )
        .build()
        .unwrap();

    let builder = RunContextBuilder::new(config).with_callbacks(callbacks());
    let (_, result) = execute(flow, builder).await;
    let result = result.unwrap();

    let outcome = result.get("consume").unwrap().outcome();
    assert_eq!(outcome["previous_text"], json!("hello ada"));
    assert_eq!(outcome["by_id"], json!("hello ada"));
    assert_eq!(outcome["many"], json!(true));
    assert_eq!(outcome["literal"], json!("$var{name}"));
    assert_eq!(outcome["where"], json!("main/consume"));
    assert_eq!(result.outcome, outcome.clone());
}

#[tokio::test]
async fn test_unresolved_variable_fails_only_that_node() {
    let dir = tempfile::tempdir().unwrap();
    let flow = ComponentDefinition::flow()
        .node("broken", echo(&[("value", "$var{nowhere}")]))
        .node("fine", echo(&[("value", "ok")]))
        .build()
        .unwrap();

    let builder = RunContextBuilder::new(config(dir.path())).with_callbacks(callbacks());
    let (_, result) = execute(flow, builder).await;
    let result = result.unwrap();

    let broken = result.get("broken").unwrap().as_node().unwrap();
    assert_eq!(broken.execution_status, ExecutionStatus::Failed);
    assert!(broken.error.as_deref().unwrap_or_default().contains("nowhere"));
    assert_eq!(result.get("fine").unwrap().outcome()["value"], json!("ok"));
}

#[tokio::test]
async fn test_conditional_runs_exactly_one_branch() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.static_variables.insert("mode".into(), json!("fast"));

    let then_branch = ComponentDefinition::flow().node("yes", echo(&[("branch", "then")])).build().unwrap();
    let else_branch = ComponentDefinition::flow().node("no", echo(&[("branch", "else")])).build().unwrap();
    let flow = ComponentDefinition::flow()
        .conditional(
            "check",
            Conditional::new("mode == 'fast'", then_branch.clone()).otherwise(else_branch.clone()),
        )
        .conditional(
            "recheck",
            Conditional::new("$expr{mode != 'fast'}", then_branch).otherwise(else_branch),
        )
        .build()
        .unwrap();

    let builder = RunContextBuilder::new(config).with_callbacks(callbacks());
    let (run, result) = execute(flow, builder).await;
    let result = result.unwrap();

    let check = result.get("check").unwrap().as_component().unwrap();
    assert_eq!(check.component_type, "conditional");
    assert!(check.get("yes").is_some());
    assert!(check.get("no").is_none());
    assert_eq!(check.outcome["branch"], json!("then"));
    assert!(run.run_dir.join("main/check/yes/outcome.json").is_file());

    let recheck = result.get("recheck").unwrap().as_component().unwrap();
    assert!(recheck.get("yes").is_none());
    assert_eq!(result.find("recheck/no").unwrap().outcome()["branch"], json!("else"));
}

#[tokio::test]
async fn test_conditional_without_else_records_empty_result() {
    let dir = tempfile::tempdir().unwrap();
    let then_branch = ComponentDefinition::flow().node("yes", echo(&[("branch", "then")])).build().unwrap();
    let flow = ComponentDefinition::flow()
        .conditional("check", Conditional::new("false", then_branch))
        .build()
        .unwrap();

    let builder = RunContextBuilder::new(config(dir.path())).with_callbacks(callbacks());
    let (_, result) = execute(flow, builder).await;
    let check = result.unwrap().get("check").unwrap().as_component().unwrap().clone();
    assert!(check.execution_results.is_empty());
    assert_eq!(check.outcome["condition"], json!(false));
    assert_eq!(check.outcome["branch"], NodeValue::Null);
}

#[tokio::test]
async fn test_for_each_is_bounded_and_collects_outcomes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.static_variables.insert("items".into(), json!(["a", "b", "c", "d"]));

    let body = ComponentDefinition::flow()
        .node("visit", echo(&[("value", "$var{item}"), ("position", "$var{index}")]))
        .build()
        .unwrap();
    let flow = ComponentDefinition::flow()
        .for_each(
            "loop",
            ForEach::new("$var{items}", body).max_iterations(3).record_iteration_outcome(true),
        )
        .node("after", echo(&[("seen", "$hier{loop}.outcome.iterations")]))
        .build()
        .unwrap();

    let builder = RunContextBuilder::new(config).with_callbacks(callbacks());
    let (run, result) = execute(flow, builder).await;
    let result = result.unwrap();

    let looped = result.get("loop").unwrap().as_component().unwrap();
    assert_eq!(looped.component_type, "for_each");
    assert_eq!(looped.execution_order, vec!["iter_0", "iter_1", "iter_2"]);
    assert_eq!(looped.outcome["iterations"], json!(3));
    assert_eq!(looped.outcome["total_items"], json!(4));
    assert_eq!(looped.outcome["truncated"], json!(true));
    assert_eq!(looped.outcome["collected"][2], json!({"value": "c", "position": 2}));

    let visit = result.find("loop/iter_1/visit").unwrap();
    assert_eq!(visit.hierarchy_path(), "main/loop/iter_1/visit");
    assert!(run.run_dir.join("main/loop/iter_0/visit/result.json").is_file());
    assert!(run.run_dir.join("main/loop/iter_2/outcome.json").is_file());
    assert!(!run.run_dir.join("main/loop/iter_3").exists());

    assert_eq!(result.get("after").unwrap().outcome()["seen"], json!(3));
}

#[tokio::test]
async fn test_for_each_zero_bound_runs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.static_variables.insert("items".into(), json!(["a", "b"]));

    let body = ComponentDefinition::flow().node("visit", echo(&[("value", "$var{item}")])).build().unwrap();
    let flow = ComponentDefinition::flow()
        .for_each("loop", ForEach::new("$var{items}", body).max_iterations(0))
        .build()
        .unwrap();
    assert!(flow.validate().has_warnings());

    let builder = RunContextBuilder::new(config).with_callbacks(callbacks());
    let (_, result) = execute(flow, builder).await;
    let looped = result.unwrap().get("loop").unwrap().as_component().unwrap().clone();
    assert_eq!(looped.outcome["iterations"], json!(0));
    assert_eq!(looped.outcome["truncated"], json!(true));
    assert!(looped.execution_order.is_empty());
}

#[tokio::test]
async fn test_for_each_rejects_non_list_statement() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.static_variables.insert("items".into(), json!("not a list"));

    let body = ComponentDefinition::flow().node("visit", echo(&[("value", "$var{item}")])).build().unwrap();
    let flow = ComponentDefinition::flow()
        .for_each("loop", ForEach::new("items", body))
        .build()
        .unwrap();

    let builder = RunContextBuilder::new(config).with_callbacks(callbacks());
    let (_, result) = execute(flow, builder).await;
    assert!(matches!(result, Err(FlowError::InvalidInput { .. })));
}

#[test]
fn test_duplicate_ids_and_default_resources_fail_validation() {
    let duplicated = ComponentDefinition::flow()
        .node("same", echo(&[]))
        .node("same", echo(&[]))
        .build();
    assert!(matches!(duplicated, Err(FlowError::Validation(msg)) if msg.contains("duplicate")));

    let two_defaults = NodeDefinition::new(AIModelNodeSettings::new("hi"))
        .with_resource(ResourceQuery::profile("a").as_default())
        .with_resource(ResourceQuery::profile("b").as_default());
    let flow = ComponentDefinition::flow().node("ask", two_defaults).build();
    assert!(matches!(flow, Err(FlowError::Validation(msg)) if msg.contains("is_default")));
}

#[tokio::test]
async fn test_input_request_channel_delivers_node_input() {
    let dir = tempfile::tempdir().unwrap();
    let flow = ComponentDefinition::flow()
        .node("ask", echo(&[("answer", "$var{answer}")]).requires_input())
        .build()
        .unwrap();

    let builder = RunContextBuilder::new(config(dir.path())).with_callbacks(callbacks());
    let runner = Runner::new(flow, builder.build("main").unwrap()).unwrap();
    let mut requests = runner.events().input_requests();
    let responder = tokio::spawn(async move {
        let request = requests.recv().await.unwrap();
        assert_eq!(request.node_hier, "main/ask");
        assert_eq!(request.node_type, "callback");
        request.respond(NodeInput::default().with_variable("answer", json!(42)))
    });

    let result = runner.run().await.unwrap();
    assert!(responder.await.unwrap());
    let ask = result.get("ask").unwrap().as_node().unwrap();
    assert_eq!(ask.outcome["answer"], json!(42));
    assert_eq!(ask.input.as_ref().unwrap()["variables"]["answer"], json!(42));
}

#[tokio::test]
async fn test_static_input_skips_the_request() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.static_inputs.insert(
        "main/ask".into(),
        NodeInput::default().with_variable("answer", json!("static")),
    );
    let flow = ComponentDefinition::flow()
        .node("ask", echo(&[("answer", "$var{answer}")]).requires_input())
        .build()
        .unwrap();

    let builder = RunContextBuilder::new(config).with_callbacks(callbacks());
    let (run, result) = execute(flow, builder).await;
    let result = result.unwrap();

    assert_eq!(result.get("ask").unwrap().outcome()["answer"], json!("static"));
    assert!(run.static_inputs_dir.join("main__ask.json").is_file());
}

struct ScriptedProvider;

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ProviderError> {
        Ok(ModelResponse {
            text: format!("echo: {}", request.prompt),
            ..ModelResponse::default()
        })
    }

    async fn stream(
        &self,
        _request: ModelRequest,
    ) -> Result<BoxStream<'static, Result<String, ProviderError>>, ProviderError> {
        let chunks = vec![
            Ok("par".to_string()),
            Ok("tial".to_string()),
            Err(ProviderError::Interrupted("connection reset".into())),
            Ok("never".to_string()),
        ];
        Ok(stream::iter(chunks).boxed())
    }
}

#[tokio::test]
async fn test_model_calls_use_resolved_provider() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.static_variables.insert("topic".into(), json!("rust"));

    let registry = ResourceRegistry::new();
    assert!(registry.register("local", Arc::new(ScriptedProvider)));
    assert!(!registry.register("local", Arc::new(ScriptedProvider)));

    let flow = ComponentDefinition::flow()
        .node(
            "summary",
            NodeDefinition::new(AIModelNodeSettings::new("Summarize $var{topic}"))
                .with_resource(ResourceQuery::profile("local")),
        )
        .node(
            "followup",
            NodeDefinition::new(AIModelNodeSettings::new("Expand").context_source("summary")),
        )
        .node(
            "streamed",
            NodeDefinition::new(AIModelNodeSettings::new("Stream it").stream(true)),
        )
        .build()
        .unwrap();

    let builder = RunContextBuilder::new(config).with_resources(Arc::new(registry));
    let (_, result) = execute(flow, builder).await;
    let result = result.unwrap();

    let summary = result.get("summary").unwrap().as_node().unwrap();
    assert_eq!(summary.outcome["text"], json!("echo: Summarize rust"));
    assert_eq!(summary.output["request"]["prompt"], json!("Summarize rust"));

    let followup = result.get("followup").unwrap().as_node().unwrap();
    assert_eq!(followup.output["request"]["context"], json!(["echo: Summarize rust"]));

    let streamed = result.get("streamed").unwrap().as_node().unwrap();
    assert_eq!(streamed.execution_status, ExecutionStatus::Cancelled);
    assert_eq!(streamed.outcome["text"], json!("partial"));
    assert!(streamed.error.as_deref().unwrap_or_default().contains("connection reset"));
    assert_eq!(result.execution_status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_model_call_without_resource_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let flow = ComponentDefinition::flow()
        .node("summary", NodeDefinition::new(AIModelNodeSettings::new("hi")))
        .build()
        .unwrap();

    let (_, result) = execute(flow, RunContextBuilder::new(config(dir.path()))).await;
    assert!(matches!(result, Err(FlowError::InvalidInput { node_id, .. }) if node_id == "summary"));
}

struct Shout;

#[async_trait]
impl NodeExecutor for Shout {
    async fn execute_node(
        &self,
        node_id: &str,
        definition: &NodeDefinition,
        context: &mut ExecutionContext,
        _input: Option<NodeInput>,
        _resource: Option<ResourceConfig>,
    ) -> Result<NodeExecutionResult, FlowError> {
        let NodeSettings::Custom(custom) = &definition.settings else {
            return Err(FlowError::InvalidInput {
                node_id: node_id.to_string(),
                message: "expected custom settings".into(),
            });
        };
        let settings = context.render_value(&custom.settings)?;
        let text = settings["text"].as_str().unwrap_or_default().to_uppercase();
        Ok(NodeExecutionResult::running(node_id, context.current_hier(), "shout")
            .completed(settings.clone(), json!({ "text": text })))
    }
}

#[tokio::test]
async fn test_custom_executor_and_basic_agent() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.static_variables.insert("name".into(), json!("ada"));

    let inner = ComponentDefinition::agent()
        .node("greet", NodeDefinition::custom("shout", json!({"text": "hi $var{name}"})))
        .node("repeat", echo(&[("again", "$hier{previous}.outcome.text")]))
        .build()
        .unwrap();
    let flow = ComponentDefinition::flow()
        .node("agent", NodeDefinition::new(inner))
        .build()
        .unwrap();

    let builder = RunContextBuilder::new(config)
        .with_callbacks(callbacks())
        .with_executor("shout", Arc::new(Shout));
    let (run, result) = execute(flow, builder).await;
    let result = result.unwrap();

    let agent = result.get("agent").unwrap().as_node().unwrap();
    assert_eq!(agent.node_type, "basic_agent");
    assert_eq!(agent.outcome["outcomes"]["greet"]["text"], json!("HI ADA"));
    assert_eq!(agent.outcome["final"]["again"], json!("HI ADA"));
    assert!(run.run_dir.join("main/agent/greet/outcome.json").is_file());
    assert!(run.run_dir.join("main/agent/result.json").is_file());
}

#[tokio::test]
async fn test_unknown_executor_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let flow = ComponentDefinition::flow()
        .node("mystery", NodeDefinition::custom("nobody", NodeValue::Null))
        .build()
        .unwrap();
    let (_, result) = execute(flow, RunContextBuilder::new(config(dir.path()))).await;
    assert!(matches!(result, Err(FlowError::ExecutorNotFound(name)) if name == "nobody"));
}

#[tokio::test]
async fn test_record_settings_formats() {
    let dir = tempfile::tempdir().unwrap();
    let records = NodeRecordSettings {
        input: None,
        result: Some(RecordSettings::in_node_dir("result.json", FileFormat::Json)),
        outcome: Some(RecordSettings::new("reports", "$var{node_id}.yaml", FileFormat::Yaml)),
    };
    let flow = ComponentDefinition::flow()
        .node("note", echo(&[("text", "hello")]).with_record_settings(records))
        .node(
            "quiet",
            echo(&[("text", "shh")]).with_record_settings(NodeRecordSettings {
                input: None,
                result: None,
                outcome: None,
            }),
        )
        .build()
        .unwrap();

    let builder = RunContextBuilder::new(config(dir.path())).with_callbacks(callbacks());
    let (run, result) = execute(flow, builder).await;
    result.unwrap();

    let yaml = std::fs::read_to_string(run.run_dir.join("reports/note.yaml")).unwrap();
    assert!(yaml.contains("text: hello"));
    let recorded: NodeExecutionResult =
        serde_json::from_str(&std::fs::read_to_string(run.run_dir.join("main/note/result.json")).unwrap()).unwrap();
    assert_eq!(recorded.outcome, json!({"text": "hello"}));
    assert!(!run.run_dir.join("main/quiet").exists());
}

#[derive(Default)]
struct RecordingGit {
    commits: Mutex<Vec<(PathBuf, Vec<PathBuf>, String)>>,
}

#[async_trait]
impl GitCollaborator for RecordingGit {
    async fn commit_files(&self, repo_dir: &Path, files: &[PathBuf], message: &str) -> Result<bool, GitError> {
        self.commits
            .lock()
            .unwrap()
            .push((repo_dir.to_path_buf(), files.to_vec(), message.to_string()));
        Ok(true)
    }
}

#[tokio::test]
async fn test_git_settings_commit_into_outcome_repo() {
    let dir = tempfile::tempdir().unwrap();
    let git = Arc::new(RecordingGit::default());
    let flow = ComponentDefinition::flow()
        .node(
            "note",
            echo(&[("text", "hello")]).with_git_settings(GitSettings {
                commit: true,
                commit_message: Some("record $var{node_id}".into()),
            }),
        )
        .build()
        .unwrap();

    let builder = RunContextBuilder::new(config(dir.path()))
        .with_callbacks(callbacks())
        .with_git(git.clone());
    let (run, result) = execute(flow, builder).await;
    result.unwrap();

    let commits = git.commits.lock().unwrap();
    assert_eq!(commits.len(), 1);
    let (repo, files, message) = &commits[0];
    assert_eq!(repo, &run.outcome_repo_dir);
    assert_eq!(message, "record note");
    assert_eq!(files, &vec![run.outcome_repo_dir.join("main/note/outcome.json")]);
    assert!(run.outcome_repo_dir.join("main/note/outcome.json").is_file());
    assert!(!run.outcome_repo_dir.join("main/note/result.json").exists());
    assert!(run.run_dir.join("main/note/result.json").is_file());
    assert!(run.run_dir.join("main/note/outcome.json").is_file());
}

struct Collect(tokio::sync::mpsc::UnboundedSender<Event>);

#[async_trait]
impl EventHandler for Collect {
    async fn handle(&self, event: &Event) {
        let _ = self.0.send(event.clone());
    }
}

#[tokio::test]
async fn test_node_events_are_published() {
    let dir = tempfile::tempdir().unwrap();
    let events = Arc::new(EventBus::new());
    let (sender, mut received) = tokio::sync::mpsc::unbounded_channel();
    events.subscribe(EventType::NodeExecutionComplete, Arc::new(Collect(sender)));

    let flow = ComponentDefinition::flow()
        .node("one", echo(&[("n", "1")]))
        .node("two", echo(&[("n", "2")]))
        .build()
        .unwrap();
    let builder = RunContextBuilder::new(config(dir.path()))
        .with_callbacks(callbacks())
        .with_events(events);
    let (_, result) = execute(flow, builder).await;
    result.unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let event = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(event.source_hier);
    }
    seen.sort();
    assert_eq!(seen, vec!["main/one", "main/two"]);
}

#[tokio::test]
async fn test_yaml_flow_runs_commands() {
    let dir = tempfile::tempdir().unwrap();
    let flow = ComponentDefinition::from_yaml(
        r#"
kind: flow
description: say hello
elements:
  - id: hello
    element:
      element_type: node
      settings:
        node_type: command
        commands: ["echo hello"]
  - id: shout
    element:
      element_type: node
      settings:
        node_type: command
        commands: ["echo '$hier{hello}.outcome.results[0].stdout' | tr a-z A-Z"]
"#,
    )
    .unwrap();

    let (_, result) = execute(flow, RunContextBuilder::new(config(dir.path()))).await;
    let result = result.unwrap();
    assert!(result.execution_status.is_success());
    let stdout = result.get("shout").unwrap().outcome()["results"][0]["stdout"].clone();
    assert_eq!(stdout.as_str().unwrap().trim(), "HELLO");
}

#[tokio::test]
async fn test_file_operations_planned_by_previous_node() {
    let dir = tempfile::tempdir().unwrap();
    let mut callbacks = callbacks();
    callbacks.register_fn("plan", |_args: CallbackArgs| {
        Ok(json!({
            "operations": [
                {"type": "create_file", "path": "docs/$var{topic}.md", "content": "draft: old\nend\n"},
                {"type": "modify_file", "path": "docs/$var{topic}.md", "content": {
                    "start_point_match": "draft: ", "end_point_match": "\nend", "content": "final"
                }},
                {"type": "create_file", "path": "../outside.md", "content": "nope"}
            ]
        }))
    });
    let mut builder_config = config(dir.path());
    builder_config.static_variables.insert("topic".into(), json!("rust"));

    let flow = ComponentDefinition::flow()
        .node("plan", NodeDefinition::new(CallbackSettings::new("plan")))
        .node(
            "apply",
            NodeDefinition::new(
                FileOperationSettings::new("work").operations_template("$hier{plan}.outcome.operations"),
            ),
        )
        .build()
        .unwrap();

    let builder = RunContextBuilder::new(builder_config).with_callbacks(callbacks);
    let (run, result) = execute(flow, builder).await;
    let result = result.unwrap();

    let written = std::fs::read_to_string(run.run_dir.join("work/docs/rust.md")).unwrap();
    assert_eq!(written, "draft: final\nend\n");
    assert!(!run.run_dir.join("outside.md").exists());

    let apply = result.get("apply").unwrap();
    assert_eq!(apply.status(), ExecutionStatus::Failed);
    assert_eq!(apply.outcome()["successful_operations"], json!(2));
    assert_eq!(apply.outcome()["failed_operations"], json!(1));
}
