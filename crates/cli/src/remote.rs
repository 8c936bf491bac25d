//! `call` and `listen`: thin wrappers over [`Client`].

use std::time::Duration;

use {
    anyhow::{Context, Result, bail},
    serde_json::{Value, json},
    switchyard_client::Client,
    switchyard_config::SwitchyardConfig,
    tracing::{info, warn},
};

/// Connection flags shared by the client commands.
#[derive(clap::Args, Debug, Default)]
pub struct ConnArgs {
    /// Server URL, e.g. `ws://127.0.0.1:8765/rpc`.
    #[arg(long, short)]
    pub url: Option<String>,

    /// Bearer token sent with the upgrade request.
    #[arg(long, env = "SWITCHYARD_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

pub async fn connect(config: &SwitchyardConfig, conn: ConnArgs) -> Result<Client> {
    let url = conn.url.unwrap_or_else(|| config.client.url.clone());
    let mut builder = Client::builder().url(&url).auto_connect(false);
    if let Some(token) = conn.token {
        builder = builder.token(token);
    } else if let Some(token) = &config.client.token {
        builder = builder.secret_token(token.clone());
    }
    if let Some(timeout) = config.client.call_timeout() {
        builder = builder.call_timeout(timeout);
    }
    let client = builder.build()?;
    client
        .connect()
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    Ok(client)
}

/// Parse the `params` argument. Anything given must be a JSON array or object.
pub fn parse_params(raw: Option<&str>) -> Result<Option<Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw).context("params must be valid JSON")?;
    if !(value.is_array() || value.is_object()) {
        bail!("params must be a JSON array or object");
    }
    Ok(Some(value))
}

pub async fn call(
    config: &SwitchyardConfig,
    conn: ConnArgs,
    method: &str,
    params: Option<&str>,
    timeout: Option<Duration>,
) -> Result<()> {
    let params = parse_params(params)?;
    let client = connect(config, conn).await?;
    let mut options = switchyard_client::CallOptions::default();
    if let Some(timeout) = timeout {
        options = options.with_timeout(timeout);
    }
    let outcome = client.call_with(method, params.as_ref(), options).await;
    client.disconnect().await;

    let result = outcome.with_context(|| format!("call to '{method}' failed"))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Print every notification on `topics` as one JSON line until ctrl-c or
/// until the server goes away.
pub async fn listen(config: &SwitchyardConfig, conn: ConnArgs, topics: &[String]) -> Result<()> {
    let client = connect(config, conn).await?;

    let mut granted = 0;
    for topic in topics {
        let name = topic.clone();
        let subscribed = client
            .subscribe(topic, move |data| {
                let line = json!({"topic": name, "data": data});
                async move {
                    println!("{line}");
                    Ok(())
                }
            })
            .await?;
        if subscribed {
            granted += 1;
        } else {
            warn!(topic = %topic, "subscription refused");
        }
    }
    if granted == 0 {
        client.disconnect().await;
        bail!("no subscription was granted");
    }
    info!(topics = granted, "listening");

    let mut check = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = check.tick() => {
                if !client.is_connected() {
                    bail!("connection closed by server");
                }
            },
        }
    }
    client.disconnect().await;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case(None, None)]
    #[case(Some("[1, 2]"), Some(json!([1, 2])))]
    #[case(Some(r#"{"a": 1}"#), Some(json!({"a": 1})))]
    fn params_accepted(#[case] raw: Option<&str>, #[case] expected: Option<Value>) {
        assert_eq!(parse_params(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("[1, 2")]
    #[case("42")]
    #[case("\"text\"")]
    fn params_rejected(#[case] raw: &str) {
        assert!(parse_params(Some(raw)).is_err());
    }

    #[tokio::test]
    async fn connect_reports_the_url() {
        let config = SwitchyardConfig::default();
        let conn = ConnArgs {
            url: Some("ws://127.0.0.1:1/rpc".into()),
            token: None,
        };
        let err = connect(&config, conn).await.err().unwrap();
        assert!(err.to_string().contains("127.0.0.1:1"));
    }
}
