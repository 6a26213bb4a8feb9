#![cfg(feature = "llm-integration")]

use tidymail_core::config::ModelConfig;
use tidymail_core::llm::{
    Classification, ClassificationPrompt, GenaiLLMClient, LLMClient, LlmCallContext,
};

fn has_required_env() -> bool {
    std::env::var("OPENAI_API_KEY").is_ok()
}

fn integration_model() -> String {
    std::env::var("LLM_INTEGRATION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string())
}

#[tokio::test]
async fn classifier_picks_a_listed_category() -> Result<(), Box<dyn std::error::Error>> {
    if !has_required_env() {
        eprintln!("skipping llm integration test: OPENAI_API_KEY not set");
        return Ok(());
    }

    let model = ModelConfig {
        provider: "openai".into(),
        model: integration_model(),
        temperature: 0.0,
        max_output_tokens: 16,
        prompt_template: None,
    };
    let client = GenaiLLMClient::new(&model);
    let categories = vec!["Finance".to_string(), "Travel".to_string()];
    let email = "From: Bank <alerts@bank.example>\nSubject: Your monthly statement\n\
                 Date: Mon, 1 Jan 2024 10:00:00 +0000\n\nBody: Your account statement is ready.";

    let request = ClassificationPrompt::default().request(&categories, email, &model);
    let response = client
        .complete(request, LlmCallContext::new("llm_integration"))
        .await?;

    assert_eq!(
        Classification::parse(&response.content, &categories),
        Classification::Category("Finance".into()),
        "model response: {}",
        response.content
    );
    assert!(response.input_tokens > 0);
    Ok(())
}
