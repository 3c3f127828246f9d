use serde_json::json;
use std::collections::BTreeMap;
use url::Url;

/// Extra fields a service understands, such as `title` or `icon`
pub type Params = BTreeMap<String, String>;

/// Image shown by services that support an icon
pub const LOGO_URL: &str = "https://docs.labrange.dev/img/logo.png";

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryBody {
    Json(serde_json::Value),
    Text(String),
}

/// A ready-to-send HTTP request for one notification
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
    pub body: DeliveryBody,
}

impl Delivery {
    fn json(url: String, body: serde_json::Value) -> Self {
        Self {
            url,
            headers: Vec::new(),
            basic_auth: None,
            body: DeliveryBody::Json(body),
        }
    }
}

/// Translates a service URL (`<scheme>://...`) into an HTTP delivery
pub trait NotificationService: Send + Sync {
    fn scheme(&self) -> &'static str;

    fn prepare(&self, url: &Url, message: &str, params: &Params) -> Result<Delivery, String>;
}

/// Parameters forwarded to each known scheme
pub fn params_for(scheme: &str, subject: &str) -> Params {
    let mut params = Params::new();
    match scheme {
        "discord" | "gotify" | "ifttt" | "opsgenie" | "pushbullet" | "pushover" | "slack"
        | "telegram" => {
            params.insert("title".to_string(), subject.to_string());
        }
        "join" | "ntfy" => {
            params.insert("title".to_string(), subject.to_string());
            params.insert("icon".to_string(), LOGO_URL.to_string());
        }
        "smtp" | "standard" => {
            params.insert("subject".to_string(), subject.to_string());
        }
        "zulip" => {
            params.insert("topic".to_string(), subject.to_string());
        }
        // hangouts, mattermost, teams, rocketchat and unknown schemes take no params
        _ => {}
    }
    params
}

fn host_with_port(url: &Url) -> Result<String, String> {
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| format!("missing host in {}", url.scheme()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// `ntfy://[user:pass@]host[:port]/topic[?scheme=http]`
pub struct Ntfy;

impl NotificationService for Ntfy {
    fn scheme(&self) -> &'static str {
        "ntfy"
    }

    fn prepare(&self, url: &Url, message: &str, params: &Params) -> Result<Delivery, String> {
        let topic = url.path().trim_matches('/');
        if topic.is_empty() {
            return Err("ntfy URL has no topic".to_string());
        }
        let scheme = query_value(url, "scheme").unwrap_or_else(|| "https".to_string());
        let mut headers = Vec::new();
        if let Some(title) = params.get("title") {
            headers.push(("Title".to_string(), title.clone()));
        }
        if let Some(icon) = params.get("icon") {
            headers.push(("Icon".to_string(), icon.clone()));
        }
        let basic_auth = (!url.username().is_empty() || url.password().is_some()).then(|| {
            (
                url.username().to_string(),
                url.password().unwrap_or_default().to_string(),
            )
        });

        Ok(Delivery {
            url: format!("{}://{}/{}", scheme, host_with_port(url)?, topic),
            headers,
            basic_auth,
            body: DeliveryBody::Text(message.to_string()),
        })
    }
}

/// `gotify://host[:port][/path]/token[?disabletls=yes]`
pub struct Gotify;

impl NotificationService for Gotify {
    fn scheme(&self) -> &'static str {
        "gotify"
    }

    fn prepare(&self, url: &Url, message: &str, params: &Params) -> Result<Delivery, String> {
        let path = url.path().trim_matches('/');
        let (prefix, token) = match path.rsplit_once('/') {
            Some((prefix, token)) => (format!("/{}", prefix), token),
            None => (String::new(), path),
        };
        if token.is_empty() {
            return Err("gotify URL has no application token".to_string());
        }
        let scheme = match query_value(url, "disabletls").as_deref() {
            Some("yes") | Some("true") => "http",
            _ => "https",
        };

        Ok(Delivery::json(
            format!(
                "{}://{}{}/message?token={}",
                scheme,
                host_with_port(url)?,
                prefix,
                token
            ),
            json!({
                "title": params.get("title").cloned().unwrap_or_default(),
                "message": message,
                "priority": 5,
            }),
        ))
    }
}

/// `discord://token@webhook_id`
pub struct Discord;

impl NotificationService for Discord {
    fn scheme(&self) -> &'static str {
        "discord"
    }

    fn prepare(&self, url: &Url, message: &str, params: &Params) -> Result<Delivery, String> {
        let token = url.username();
        let webhook_id = url.host_str().unwrap_or_default();
        if token.is_empty() || webhook_id.is_empty() {
            return Err("discord URL must look like discord://token@webhook_id".to_string());
        }

        let body = match params.get("title") {
            Some(title) => json!({ "embeds": [{ "title": title, "description": message }] }),
            None => json!({ "content": message }),
        };
        Ok(Delivery::json(
            format!(
                "https://discord.com/api/webhooks/{}/{}",
                webhook_id, token
            ),
            body,
        ))
    }
}

/// `slack://hook:T000/B000/XXXX@webhook` or the legacy `slack://T000/B000/XXXX`
pub struct Slack;

impl NotificationService for Slack {
    fn scheme(&self) -> &'static str {
        "slack"
    }

    fn prepare(&self, url: &Url, message: &str, params: &Params) -> Result<Delivery, String> {
        let token = if url.username() == "hook" {
            url.password().unwrap_or_default().to_string()
        } else {
            format!(
                "{}{}",
                url.host_str().unwrap_or_default(),
                url.path().trim_end_matches('/')
            )
        };
        // Passwords arrive percent-encoded
        let token = token.replace("%2F", "/").replace("%2f", "/");
        if token.split('/').filter(|p| !p.is_empty()).count() != 3 {
            return Err("slack URL must carry a webhook token of the form A/B/C".to_string());
        }

        let text = match params.get("title") {
            Some(title) => format!("*{}*\n{}", title, message),
            None => message.to_string(),
        };
        Ok(Delivery::json(
            format!("https://hooks.slack.com/services/{}", token),
            json!({ "text": text }),
        ))
    }
}

pub fn builtin_services() -> Vec<Box<dyn NotificationService>> {
    vec![Box::new(Ntfy), Box::new(Gotify), Box::new(Discord), Box::new(Slack)]
}
