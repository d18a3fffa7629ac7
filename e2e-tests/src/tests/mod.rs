pub mod person_scenarios;


use crate::tests::test_runner::{TestRunner, TestRunnerConfig};
use anyhow::Result;

pub async fn run_tests(schema: String, test_names: Option<Vec<String>>) -> Result<()> {
    let runner = TestRunner::new(TestRunnerConfig { schema });

    let suite = if let Some(names) = test_names {
        runner.run_filtered_tests(&names).await?
    } else {
        runner.run_all_tests().await?
    };

    let failed_count = suite.failed_count() + suite.timeout_count();
    if failed_count > 0 {
        std::process::exit(1);
    }

    Ok(())
}
