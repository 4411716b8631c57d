use probe::{
    browser::{self, FlowConfig, FormFlow, PostCondition},
    eyre, get_config,
    session::Credentials,
};

#[probe::test(serial = "ui")]
async fn test_login() -> eyre::Result<()> {
    let project = get_config();
    let credentials = Credentials::from_project(&project)?;
    let mut flow = FormFlow::new(browser::session().await?, FlowConfig::from_project(&project)?);

    flow.navigate(project.page_url("login")?.as_str()).await?;
    flow.locate(
        &[
            ("email", credentials.email()),
            ("password", credentials.password()),
        ],
        "login",
    )
    .await?;
    flow.submit().await?;
    flow.verify(&PostCondition::SourceContains("Welcome".into()))
        .await?;
    Ok(())
}
