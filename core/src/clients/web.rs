use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::errors::GinError;
use crate::types::repo::{Account, PublicKey, Repository};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    sha1: String,
}

#[derive(Debug, Serialize)]
struct NewTokenRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct NewRepoRequest<'a> {
    name: &'a str,
    description: &'a str,
    private: bool,
}

#[derive(Debug, Serialize)]
struct NewKeyRequest<'a> {
    title: &'a str,
    key: &'a str,
}

/// Client for the web API of one server. A loaded token is attached to
/// every authenticated request.
#[derive(Clone, Debug)]
pub struct WebClient {
    base: String,
    token: Option<String>,
    client: Client,
}

impl WebClient {
    pub fn new(address: &str) -> Result<WebClient, GinError> {
        let client = Client::builder()
            .user_agent(concat!("gin-core/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(WebClient {
            base: address.trim_end_matches('/').to_string(),
            token: None,
            client,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> WebClient {
        self.token = token;
        self
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get(&self, path: &str) -> Result<Response, GinError> {
        let mut request = self.client.get(self.url(path));
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("token {}", token));
        }
        Ok(request.send().await?)
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<Response, GinError> {
        let mut request = self.client.post(self.url(path)).json(body);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("token {}", token));
        }
        Ok(request.send().await?)
    }

    async fn delete(&self, path: &str) -> Result<Response, GinError> {
        let mut request = self.client.delete(self.url(path));
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("token {}", token));
        }
        Ok(request.send().await?)
    }

    /// Requests a new access token with basic authentication. The caller
    /// persists it; an old token for the same alias is simply replaced.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, GinError> {
        let response = self
            .client
            .post(self.url(&format!("/api/v1/users/{}/tokens", username)))
            .basic_auth(username, Some(password))
            .json(&NewTokenRequest { name: "gin-cli" })
            .send()
            .await?;

        match response.status() {
            StatusCode::CREATED => {
                let token: TokenResponse = response.json().await?;
                info!("Obtained new token for {}", username);
                Ok(token.sha1)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(GinError::remote("login", "authorisation failed"))
            }
            StatusCode::INTERNAL_SERVER_ERROR => Err(GinError::remote("login", "server error")),
            status => Err(GinError::remote(
                "login",
                format!("login failed: [{}] {}", status.as_u16(), response.text().await?),
            )),
        }
    }

    /// The account record for `username`.
    pub async fn get_user(&self, username: &str) -> Result<Account, GinError> {
        let response = self.get(&format!("/api/v1/users/{}", username)).await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(GinError::remote(
                "get-user",
                format!("user '{}' does not exist", username),
            )),
            StatusCode::UNAUTHORIZED => Err(GinError::remote("get-user", "authorisation failed")),
            _ => Err(GinError::remote("get-user", "server error")),
        }
    }

    /// One repository by its `owner/name` path.
    pub async fn get_repo(&self, repo_path: &str) -> Result<Repository, GinError> {
        let response = self.get(&format!("/api/v1/repos/{}", repo_path)).await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(GinError::remote(
                "get-repo",
                format!("repository '{}' does not exist", repo_path),
            )),
            StatusCode::UNAUTHORIZED => Err(GinError::remote("get-repo", "authorisation failed")),
            _ => Err(GinError::remote("get-repo", "server error")),
        }
    }

    /// All repositories `username` has access to.
    pub async fn list_repos(&self, username: &str) -> Result<Vec<Repository>, GinError> {
        let response = self
            .get(&format!("/api/v1/users/{}/repos", username))
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(GinError::remote(
                "list-repos",
                format!("user '{}' does not exist", username),
            )),
            StatusCode::UNAUTHORIZED => {
                Err(GinError::remote("list-repos", "authorisation failed"))
            }
            _ => Err(GinError::remote("list-repos", "server error")),
        }
    }

    /// Creates a private repository owned by the logged-in user.
    pub async fn create_repo(&self, name: &str, description: &str) -> Result<Repository, GinError> {
        debug!("Creating repository {}", name);
        let response = self
            .post_json(
                "/api/v1/user/repos",
                &NewRepoRequest {
                    name,
                    description,
                    private: true,
                },
            )
            .await?;

        match response.status() {
            StatusCode::CREATED => Ok(response.json().await?),
            StatusCode::UNPROCESSABLE_ENTITY => Err(GinError::remote(
                "create-repo",
                format!("invalid repository name or repository '{}' already exists", name),
            )),
            StatusCode::UNAUTHORIZED => {
                Err(GinError::remote("create-repo", "authorisation failed"))
            }
            _ => Err(GinError::remote("create-repo", "server error")),
        }
    }

    /// Deletes a repository by its `owner/name` path.
    pub async fn del_repo(&self, repo_path: &str) -> Result<(), GinError> {
        let response = self.delete(&format!("/api/v1/repos/{}", repo_path)).await?;
        match response.status() {
            StatusCode::NO_CONTENT => {
                info!("Deleted repository {}", repo_path);
                Ok(())
            }
            StatusCode::FORBIDDEN => Err(GinError::remote("del-repo", "forbidden")),
            StatusCode::NOT_FOUND => Err(GinError::remote(
                "del-repo",
                format!("repository '{}' does not exist", repo_path),
            )),
            StatusCode::UNAUTHORIZED => Err(GinError::remote("del-repo", "authorisation failed")),
            _ => Err(GinError::remote("del-repo", "server error")),
        }
    }

    /// The logged-in user's SSH keys.
    pub async fn get_keys(&self) -> Result<Vec<PublicKey>, GinError> {
        let response = self.get("/api/v1/user/keys").await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::UNAUTHORIZED => Err(GinError::remote("get-keys", "authorisation failed")),
            _ => Err(GinError::remote("get-keys", "server error")),
        }
    }

    /// Registers a public key under `title`.
    pub async fn add_key(&self, key: &str, title: &str) -> Result<(), GinError> {
        let response = self
            .post_json("/api/v1/user/keys", &NewKeyRequest { title, key })
            .await?;
        match response.status() {
            StatusCode::CREATED => Ok(()),
            StatusCode::UNPROCESSABLE_ENTITY => Err(GinError::remote(
                "add-key",
                "key is invalid or already registered",
            )),
            StatusCode::UNAUTHORIZED => Err(GinError::remote("add-key", "authorisation failed")),
            _ => Err(GinError::remote("add-key", "server error")),
        }
    }

    /// Deletes a key by its server-side id.
    pub async fn delete_key(&self, id: u64) -> Result<(), GinError> {
        let response = self.delete(&format!("/api/v1/user/keys/{}", id)).await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(()),
            StatusCode::FORBIDDEN => Err(GinError::remote("delete-key", "forbidden")),
            StatusCode::UNAUTHORIZED => {
                Err(GinError::remote("delete-key", "authorisation failed"))
            }
            _ => Err(GinError::remote("delete-key", "server error")),
        }
    }

    /// Deletes the key registered under `title`, if any. Returns whether a
    /// key was found; used by logout, which treats this as best effort.
    pub async fn delete_key_by_title(&self, title: &str) -> Result<bool, GinError> {
        let keys = self.get_keys().await?;
        match keys.iter().find(|k| k.title == title) {
            Some(key) => {
                self.delete_key(key.id).await?;
                Ok(true)
            }
            None => {
                debug!("No key with title '{}' on the server", title);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn login_returns_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v1/users/alice/tokens")
                    .header_exists("authorization");
                then.status(201)
                    .json_body(json!({"name": "gin-cli", "sha1": "deadbeefcafe"}));
            })
            .await;

        let client = WebClient::new(&server.base_url()).unwrap();
        let token = client.login("alice", "secret").await.unwrap();
        assert_eq!(token, "deadbeefcafe");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn login_maps_unauthorised() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/users/alice/tokens");
                then.status(401);
            })
            .await;

        let client = WebClient::new(&server.base_url()).unwrap();
        let err = client.login("alice", "wrong").await.unwrap_err();
        assert_eq!(err.to_string(), "authorisation failed");
    }

    #[tokio::test]
    async fn get_repo_sends_token_and_parses() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/v1/repos/alice/empty")
                    .header("authorization", "token deadbeef");
                then.status(200).json_body(json!({
                    "id": 1,
                    "owner": {"id": 2, "login": "alice"},
                    "name": "empty",
                    "full_name": "alice/empty",
                    "private": true
                }));
            })
            .await;

        let client = WebClient::new(&server.base_url())
            .unwrap()
            .with_token(Some("deadbeef".into()));
        let repo = client.get_repo("alice/empty").await.unwrap();
        assert_eq!(repo.full_name, "alice/empty");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_repo_has_domain_message() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v1/repos/alice/gone");
                then.status(404);
            })
            .await;

        let client = WebClient::new(&server.base_url()).unwrap();
        let err = client.get_repo("alice/gone").await.unwrap_err();
        assert_eq!(err.to_string(), "repository 'alice/gone' does not exist");
    }

    #[tokio::test]
    async fn create_repo_maps_name_conflicts() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/user/repos");
                then.status(422);
            })
            .await;

        let client = WebClient::new(&server.base_url()).unwrap();
        let err = client.create_repo("taken", "").await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn del_repo_maps_forbidden() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/api/v1/repos/bob/data");
                then.status(403);
            })
            .await;

        let client = WebClient::new(&server.base_url()).unwrap();
        let err = client.del_repo("bob/data").await.unwrap_err();
        assert_eq!(err.to_string(), "forbidden");
    }

    #[tokio::test]
    async fn delete_key_by_title_round_trip() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v1/user/keys");
                then.status(200).json_body(json!([
                    {"id": 11, "key": "ssh-rsa AAAA...", "title": "GIN Client: alice@lab"},
                    {"id": 12, "key": "ssh-rsa BBBB...", "title": "laptop"}
                ]));
            })
            .await;
        let delete_mock = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/api/v1/user/keys/11");
                then.status(204);
            })
            .await;

        let client = WebClient::new(&server.base_url()).unwrap();
        let removed = client
            .delete_key_by_title("GIN Client: alice@lab")
            .await
            .unwrap();
        assert!(removed);
        delete_mock.assert_async().await;

        let removed = client.delete_key_by_title("missing").await.unwrap();
        assert!(!removed);
    }
}
