use minijinja::{context, Environment};
use serde::Serialize;
use serde_json::{Map, Value};

const FLOW_STEP_TEMPLATE: &str = include_str!("prompts/flow_step.j2");

#[derive(Debug, Clone, Serialize)]
pub struct TransitionOption {
    pub id: String,
    pub label: String,
}

pub struct FlowStepPromptContext<'a> {
    pub global_prompt: &'a str,
    pub step_name: &'a str,
    pub objective: &'a str,
    pub step_prompt: &'a str,
    pub routing_instructions: &'a str,
    pub transitions: &'a [TransitionOption],
    pub collected_data: &'a Map<String, Value>,
}

impl FlowStepPromptContext<'_> {
    fn collected_data_text(&self) -> String {
        if self.collected_data.is_empty() {
            return String::new();
        }
        serde_json::to_string_pretty(self.collected_data).unwrap_or_default()
    }
}

pub fn render_flow_step_prompt(ctx: &FlowStepPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env.add_template("flow_step", FLOW_STEP_TEMPLATE).is_err() {
        return fallback_flow_step_prompt(ctx);
    }

    let Ok(template) = env.get_template("flow_step") else {
        return fallback_flow_step_prompt(ctx);
    };

    template
        .render(context! {
            global_prompt => ctx.global_prompt.trim(),
            step_name => ctx.step_name.trim(),
            objective => ctx.objective.trim(),
            step_prompt => ctx.step_prompt.trim(),
            routing_instructions => ctx.routing_instructions.trim(),
            transitions => ctx.transitions,
            collected_data => ctx.collected_data_text(),
        })
        .unwrap_or_else(|_| fallback_flow_step_prompt(ctx))
}

fn fallback_flow_step_prompt(ctx: &FlowStepPromptContext<'_>) -> String {
    let mut prompt = String::new();
    if !ctx.global_prompt.trim().is_empty() {
        prompt.push_str(ctx.global_prompt.trim());
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!(
        "You are handling the step \"{}\" of a customer-service conversation.\n",
        ctx.step_name.trim()
    ));

    for (heading, body) in [
        ("Step objective", ctx.objective),
        ("Step instructions", ctx.step_prompt),
        ("Routing instructions", ctx.routing_instructions),
    ] {
        if !body.trim().is_empty() {
            prompt.push_str(&format!("\n{heading}:\n{}\n", body.trim()));
        }
    }

    if ctx.transitions.is_empty() {
        prompt.push_str("\nThis step has no onward steps. Always set nextStepId to null.\n");
    } else {
        prompt.push_str("\nYou may move the conversation to one of these steps:\n");
        for transition in ctx.transitions {
            prompt.push_str(&format!("- {}: {}\n", transition.id, transition.label));
        }
    }

    let collected = ctx.collected_data_text();
    if !collected.is_empty() {
        prompt.push_str("\nData already collected from the customer:\n");
        prompt.push_str(&collected);
        prompt.push('\n');
    }

    prompt.push_str(
        "\nReply only with a JSON object: \
         {\"reply\": string, \"nextStepId\": string|null, \"collectedData\": object, \"handoff\": bool}\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transitions() -> Vec<TransitionOption> {
        vec![TransitionOption {
            id: "quote".into(),
            label: "Cliente quer cotação".into(),
        }]
    }

    #[test]
    fn template_lists_transitions_and_collected_data() {
        let options = transitions();
        let mut collected = Map::new();
        collected.insert("vehicle".into(), Value::String("Onix 2020".into()));
        let rendered = render_flow_step_prompt(&FlowStepPromptContext {
            global_prompt: "Você é a assistente da corretora.",
            step_name: "Triagem",
            objective: "Descobrir o tipo de seguro",
            step_prompt: "",
            routing_instructions: "Se pedir preço, vá para cotação",
            transitions: &options,
            collected_data: &collected,
        });
        assert!(rendered.starts_with("Você é a assistente da corretora."));
        assert!(rendered.contains("- quote: Cliente quer cotação"));
        assert!(rendered.contains("Onix 2020"));
        assert!(rendered.contains("\"nextStepId\""));
    }

    #[test]
    fn terminal_step_says_so() {
        let collected = Map::new();
        let ctx = FlowStepPromptContext {
            global_prompt: "",
            step_name: "Encerramento",
            objective: "",
            step_prompt: "Agradeça",
            routing_instructions: "",
            transitions: &[],
            collected_data: &collected,
        };
        assert!(render_flow_step_prompt(&ctx).contains("no onward steps"));
        assert!(fallback_flow_step_prompt(&ctx).contains("no onward steps"));
    }
}
