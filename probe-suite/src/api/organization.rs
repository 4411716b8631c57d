use probe::{
    assertion::{assert_success, Expectations},
    eyre, get_config,
    http::{Client, Response},
    masking, report, session,
};

fn formatted(response: &Response, with_headers: bool) -> String {
    let body = masking::mask_body(response.text());
    let body = serde_json::from_str::<serde_json::Value>(&body)
        .and_then(|value| serde_json::to_string_pretty(&value))
        .unwrap_or(body);
    if with_headers {
        format!(
            "Status: {}\nHeaders: {:?}\n\nBody:\n{body}",
            response.status().as_u16(),
            masking::mask_headers(response.headers())
        )
    } else {
        format!("Status Code: {}\n\nResponse:\n{body}", response.status().as_u16())
    }
}

/// The token travels as a query parameter here.
#[probe::test(48)]
async fn test_get_single_organization_detail(org_id: u32) -> eyre::Result<()> {
    let token = session::token().await?;
    let url = get_config().api_url("api/v1/get-single-organization-detail")?;

    let exchange = Client::new()
        .get(url)
        .query(&[("org_id", org_id)])
        .query(&[("token", token.as_str())])
        .exchange()
        .await?;

    report::attach_json("Request Parameters", &exchange.request.params);
    report::attach_response("Complete Response Body", &exchange.response);
    report::attach_text("Formatted Response", formatted(&exchange.response, false));

    assert_success(&exchange.response, &Expectations::status(200).truthy("success"))?;
    Ok(())
}

#[probe::test(48, 115)]
async fn test_get_organization(org_id: u32, ogs_id: u32) -> eyre::Result<()> {
    let token = session::token().await?;
    let url = get_config().api_url("api/v1/get-organizition")?;

    let exchange = Client::new()
        .get(url)
        .query(&[("org_id", org_id), ("ogs_id", ogs_id)])
        .bearer_auth(token.as_str())
        .exchange()
        .await?;

    report::attach_request("Complete Request Details", &exchange.request);
    report::attach_response("Complete API Response", &exchange.response);
    report::attach_text(
        "Formatted Response with Headers",
        formatted(&exchange.response, true),
    );

    assert_success(&exchange.response, &Expectations::status(200).present("success"))?;
    Ok(())
}
