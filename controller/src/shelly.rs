use std::time::Duration;

use async_trait::async_trait;
use heater_common::{RelayClient, RelayConfig, RelayError};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct SwitchStatus {
    output: bool,
}

#[derive(Debug, Deserialize)]
struct ScriptStatus {
    running: bool,
}

/// Shelly Pro 3 relay, driven through its `/rpc` HTTP API.
#[derive(Debug)]
pub struct ShellyPro3 {
    address: String,
    request_timeout: Duration,
    script_timeout: Duration,
    auto_off_minutes: u32,
    client: RwLock<Client>,
}

impl ShellyPro3 {
    pub fn new(config: &RelayConfig) -> anyhow::Result<Self> {
        Ok(Self {
            address: config.address.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            script_timeout: Duration::from_secs(config.script_timeout_secs),
            auto_off_minutes: config.auto_off_minutes,
            client: RwLock::new(Client::builder().build()?),
        })
    }

    async fn client(&self) -> Client {
        self.client.read().await.clone()
    }

    async fn renew_session(&self) {
        info!("renew session");
        match Client::builder().build() {
            Ok(client) => *self.client.write().await = client,
            Err(err) => warn!("could not renew http session: {err}"),
        }
    }

    async fn get(&self, uri: &str, timeout: Duration) -> Result<Response, RelayError> {
        let result = self.client().await.get(uri).timeout(timeout).send().await;
        self.finish(uri, result).await
    }

    async fn post_json(
        &self,
        uri: &str,
        body: &serde_json::Value,
    ) -> Result<Response, RelayError> {
        let result = self
            .client()
            .await
            .post(uri)
            .timeout(self.script_timeout)
            .json(body)
            .send()
            .await;
        self.finish(uri, result).await
    }

    async fn finish(
        &self,
        uri: &str,
        result: reqwest::Result<Response>,
    ) -> Result<Response, RelayError> {
        match result {
            Ok(response) => Ok(response),
            Err(err) => {
                self.renew_session().await;
                Err(transport_error(uri, &err))
            }
        }
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        &self,
        uri: &str,
        response: Response,
    ) -> Result<T, RelayError> {
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                self.renew_session().await;
                return Err(transport_error(uri, &err));
            }
        };

        if status != StatusCode::OK {
            self.renew_session().await;
            return Err(protocol_error(uri, status, body));
        }
        match serde_json::from_str(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) => {
                self.renew_session().await;
                Err(protocol_error(uri, status, body))
            }
        }
    }

    fn script_id(channel: usize) -> usize {
        channel + 1
    }

    async fn enable_script(&self, id: usize) -> Result<(), RelayError> {
        let uri = format!(
            "{}/rpc/Script.SetConfig?id={id}&config=%7B%22enable%22%3Atrue%7D",
            self.address
        );
        let response = self.get(&uri, self.script_timeout).await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::OK {
            debug!("shelly script {id} enabled {body}");
        } else {
            debug!("could not enable shelly script {id} {body}");
        }
        Ok(())
    }
}

fn transport_error(uri: &str, err: &reqwest::Error) -> RelayError {
    RelayError::Transport {
        uri: uri.to_string(),
        reason: err.to_string(),
    }
}

fn protocol_error(uri: &str, status: StatusCode, body: String) -> RelayError {
    RelayError::Protocol {
        uri: uri.to_string(),
        status: status.as_u16(),
        body,
    }
}

/// Device-side watchdog: switches the channel off `minutes` after every
/// switch-on it observes.
pub fn auto_off_script(channel: usize, minutes: u32) -> String {
    format!(
        r#"
Shelly.addStatusHandler(function(e) {{
  if (e.component === "switch:{channel}") {{
    if (e.delta.output === true) {{
      print("heater {channel} is on");
      Timer.set({minutes}*60*1000, false, function (ud) {{
        Shelly.call("Switch.set", {{'id': {channel}, 'on': false}});
      }}, null);
    }} else {{
      print("heater {channel} is off");
    }}
  }}
}});
"#
    )
}

#[async_trait]
impl RelayClient for ShellyPro3 {
    async fn query_state(&self, channel: usize) -> Result<bool, RelayError> {
        let uri = format!("{}/rpc/Switch.GetStatus?id={channel}", self.address);
        let response = self.get(&uri, self.request_timeout).await?;
        let status: SwitchStatus = self.read_json(&uri, response).await?;
        Ok(status.output)
    }

    async fn set_state(&self, channel: usize, on: bool) -> Result<(), RelayError> {
        let uri = format!(
            "{}/rpc/Switch.Set?id={channel}&on={}",
            self.address,
            if on { "true" } else { "false" }
        );
        let response = self.get(&uri, self.request_timeout).await?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            self.renew_session().await;
            return Err(protocol_error(&uri, status, body));
        }
        Ok(())
    }

    async fn ensure_auto_off_script(&self, channel: usize) -> Result<(), RelayError> {
        let id = Self::script_id(channel);
        let status_uri = format!("{}/rpc/Script.GetStatus?id={id}", self.address);
        let exists = self.get(&status_uri, self.script_timeout).await?.status() == StatusCode::OK;

        if exists {
            let uri = format!("{}/rpc/Script.Stop?id={id}", self.address);
            let response = self.get(&uri, self.script_timeout).await?;
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::OK {
                debug!("shelly script {id} stopped {body}");
            } else {
                warn!("could not stop shelly script {id} {body}");
            }
        } else {
            let uri = format!("{}/rpc/Script.Create", self.address);
            let request = json!({ "id": id, "name": format!("auto_off_{channel}") });
            let response = self.post_json(&uri, &request).await?;
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::OK {
                debug!("shelly script {id} created {body}");
            } else {
                warn!("could not create shelly script {id} {body}");
            }

            let uri = format!("{}/rpc/Script.PutCode", self.address);
            let request = json!({
                "id": id,
                "code": auto_off_script(channel, self.auto_off_minutes),
                "append": false,
            });
            let response = self.post_json(&uri, &request).await?;
            let status = response.status();
            if status == StatusCode::OK {
                info!("shelly script {id} uploaded");
            } else {
                let body = response.text().await.unwrap_or_default();
                warn!("could not upload shelly script {id} {body}");
            }
        }

        self.enable_script(id).await?;
        self.ensure_script_running(channel).await
    }

    async fn ensure_script_running(&self, channel: usize) -> Result<(), RelayError> {
        let id = Self::script_id(channel);
        let uri = format!("{}/rpc/Script.GetStatus?id={id}", self.address);
        let response = self.get(&uri, self.script_timeout).await?;
        let status: ScriptStatus = self.read_json(&uri, response).await?;
        if status.running {
            return Ok(());
        }

        let uri = format!("{}/rpc/Script.Start?id={id}", self.address);
        let response = self.get(&uri, self.script_timeout).await?;
        if response.status() == StatusCode::OK {
            info!("shelly script {id} (re)started");
        } else {
            let body = response.text().await.unwrap_or_default();
            debug!("could not (re)start shelly script {id} {body}");
        }
        Ok(())
    }
}
