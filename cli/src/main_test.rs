use clap::CommandFactory;

use super::*;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("shortlink").chain(args.iter().copied())).unwrap()
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn can_splits_comma_separated_authorities() {
    let cli = parse(&["can", "--any-of", "url:view,url:create"]);
    let Command::Can(args) = cli.command else {
        panic!("expected can");
    };
    assert_eq!(args.any_of, Some(vec!["url:view".to_owned(), "url:create".to_owned()]));
    assert_eq!(args.authority, None);
}

#[test]
fn watch_bounce_requires_public_page() {
    let result = Cli::try_parse_from(["shortlink", "watch", "--redirect-if-authenticated"]);
    assert!(result.is_err());

    let cli = parse(&["watch", "--public", "--redirect-if-authenticated", "--redirect-path", "/url"]);
    let Command::Watch(args) = cli.command else {
        panic!("expected watch");
    };
    assert!(args.public);
    assert_eq!(args.redirect_path, "/url");
}

#[test]
fn url_retarget_takes_id_and_target() {
    let cli = parse(&["url", "retarget", "42", "https://example.test/next"]);
    let Command::Url(UrlCommand { command: UrlSubcommand::Retarget { id, url } }) = cli.command else {
        panic!("expected url retarget");
    };
    assert_eq!(id, "42");
    assert_eq!(url, "https://example.test/next");
}

#[test]
fn request_error_names_the_operation() {
    let error = CliError::Request { operation: Operation::DeleteUrl, message: "Not found".to_owned() };
    assert_eq!(error.to_string(), "DeleteUrl failed: Not found");
}

#[test]
fn flags_override_environment_config() {
    let cli = parse(&[
        "--base-url",
        "http://api.example.test/",
        "--redirector-base-url",
        "https://s.example.test/r/",
        "--session-cookie",
        "SESSION=abc",
        "status",
    ]);
    let config = resolve_config(&cli).unwrap();
    assert_eq!(config.api_base_url, "http://api.example.test");
    assert_eq!(config.redirector_base_url, "https://s.example.test/r");
    assert_eq!(config.session_cookie.as_deref(), Some("SESSION=abc"));
}

#[test]
fn schemeless_redirector_flag_is_rejected() {
    let cli = parse(&["--base-url", "http://api.example.test", "--redirector-base-url", "s.example.test", "status"]);
    assert!(matches!(resolve_config(&cli), Err(CliError::Config(_))));
}

// =============================================================================
// session
// =============================================================================

mod session {
    use axum::routing::{get, patch};
    use axum::{Json, Router};
    use serde_json::json;

    use super::super::*;

    fn identity_json(name: &str) -> Value {
        json!({
            "id": "u1",
            "name": name,
            "email": "alice@example.test",
            "createdAt": "2025-01-01T00:00:00Z",
            "updatedAt": "2025-02-01T00:00:00Z"
        })
    }

    async fn context() -> CliContext {
        let router = Router::new()
            .route("/auth/status", get(|| async { Json(json!({ "authenticated": true, "authorities": ["url:view"] })) }))
            .route("/api/v1/user/view-profile", get(|| async { Json(identity_json("Alice")) }))
            .route(
                "/api/v1/user/change/name",
                patch(|Json(body): Json<Value>| async move {
                    Json(identity_json(body["name"].as_str().unwrap_or_default()))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        CliContext::new(ClientConfig::new(&format!("http://{addr}")).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn rename_updates_the_process_session() {
        let ctx = context().await;

        let state = edit_identity(&ctx, IdentityEdit::Name("Alicia".to_owned())).await.unwrap();

        assert!(state.is_authenticated());
        assert_eq!(state.identity().map(|identity| identity.name.as_str()), Some("Alicia"));
        assert_eq!(ctx.session.identity().map(|identity| identity.name), Some("Alicia".to_owned()));
        assert!(ctx.session.has_authority("url:view"));
    }

    #[tokio::test]
    async fn failed_change_leaves_session_untouched() {
        let ctx = context().await;

        let result = edit_identity(&ctx, IdentityEdit::Email("new@example.test".to_owned())).await;

        assert!(matches!(result, Err(CliError::Request { operation: Operation::ChangeEmail, .. })));
        assert_eq!(ctx.session.identity().map(|identity| identity.email), Some("alice@example.test".to_owned()));
    }
}
