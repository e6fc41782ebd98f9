use flowscout_common::Scenario;

pub const SYSTEM_PROMPT: &str = "You are a QA engineer testing a web application through a browser. \
Work through the scenario one action at a time using the browser tools. \
Every tool call returns a screenshot of the result; read it before acting again. \
Coordinates for click are viewport pixels from the latest screenshot. \
Always respond with at least one tool call. \
When every step has been verified, or a step has clearly failed, call report_result exactly once \
with status passed or failed, a short reason, and the 1-based failed_step when it failed.";

/// First user message for a scenario
pub fn scenario_prompt(scenario: &Scenario) -> String {
    let mut out = format!("Scenario: {}\n", scenario.name);
    if !scenario.description.is_empty() {
        out.push_str(&format!("{}\n", scenario.description));
    }
    if let Some(url) = &scenario.start_url {
        out.push_str(&format!("Start URL: {}\n", url));
    }
    out.push_str("\nSteps:\n");
    for (i, step) in scenario.steps.iter().enumerate() {
        out.push_str(&format!("{}. {} {}", i + 1, step.action, step.target));
        if let Some(value) = &step.value {
            out.push_str(&format!(" with \"{}\"", value));
        }
        if let Some(expected) = &step.expected {
            out.push_str(&format!(" (expect: {})", expected));
        }
        out.push('\n');
    }
    out
}
