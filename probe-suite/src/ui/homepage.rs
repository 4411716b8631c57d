use probe::{
    browser::{self, FlowConfig, FormFlow, PostCondition},
    eyre, get_config,
};

#[probe::test(serial = "ui")]
async fn test_homepage_load() -> eyre::Result<()> {
    let project = get_config();
    let mut flow = FormFlow::new(browser::session().await?, FlowConfig::from_project(&project)?);

    flow.navigate(project.page_url("")?.as_str()).await?;
    flow.verify(&PostCondition::TitleContains("Krishivaas".into()))
        .await?;
    Ok(())
}
