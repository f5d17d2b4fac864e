//! End-to-end sign-in scenarios over the in-memory database

mod support;

use chrono::{Duration, Utc};
use url::Url;

use auth::config::{AuthConfig, Environment};
use auth::error::AuthError;
use auth::models::{
    DEV_SIGN_IN_CODE, Invitation, Organization, OrganizationPlan, Session, SessionLocation,
    SessionProvider, SignInCode, State, Token, USER_DEFAULT_PICTURE, User, UserRole,
};
use auth::oauth::OAuthUser;
use auth::processor::{SignInEnd, SignInMethod, SignInProof, SignInStart, SignInStarted};
use auth::repositories::Database;

use support::{
    FRONTEND_BASE_URL, email_sign_in, end_with, google_sign_in, harness, harness_with,
    oauth_callback, profile,
};

#[tokio::test]
async fn test_new_work_domain_gets_trial_organization() {
    let harness = harness();

    let ended = email_sign_in(&harness, "a@newcorp.com", SignInStart::default()).await;
    assert_eq!(ended.redirect_to, None);

    let identity = harness
        .processor
        .verifier()
        .check_token(&ended.token)
        .await
        .unwrap();

    assert_eq!(identity.user.email, "a@newcorp.com");
    assert_eq!(identity.user.name, "a");
    assert_eq!(identity.user.role, UserRole::Admin);
    assert_eq!(identity.organization.domain, "newcorp.com");
    assert_eq!(identity.organization.name, "newcorp");
    assert_eq!(identity.organization.plan, OrganizationPlan::Trial);
    assert!(identity.organization.settings.domain_sign_in);
    assert_eq!(identity.organization.capacity.included, 100);
    assert_eq!(identity.organization.capacity.extra, 0);
    assert_eq!(identity.session.provider, SessionProvider::Email);
    assert_eq!(identity.session.metadata.locations.len(), 1);
    assert_eq!(identity.session.metadata.locations[0].ip, "203.0.113.7");

    // checking never changes the outcome
    let again = harness
        .processor
        .verifier()
        .check_token(&ended.token)
        .await
        .unwrap();
    assert_eq!(again, identity);
}

#[tokio::test]
async fn test_invitation_decides_membership() {
    let harness = harness();
    let repositories = harness.database.repositories();
    let now = Utc::now();

    let organization = Organization::new_trial("owner@bigcorp.com", "bigcorp.com", true, now);
    repositories.organizations().create(&organization).await.unwrap();
    let invitation = Invitation::new(organization.id, "guest@gmail.com", UserRole::Member, now);
    repositories.invitations().create(&invitation).await.unwrap();

    let ended = email_sign_in(&harness, "guest@gmail.com", SignInStart::default()).await;
    let identity = harness
        .processor
        .verifier()
        .check_token(&ended.token)
        .await
        .unwrap();

    assert_eq!(identity.organization.id, organization.id);
    assert_eq!(identity.user.role, UserRole::Member);
    assert!(
        repositories
            .invitations()
            .get_by_email("guest@gmail.com")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_expired_invitation_is_consumed_and_ignored() {
    let harness = harness();
    let repositories = harness.database.repositories();
    let now = Utc::now();

    let organization = Organization::new_trial("owner@bigcorp.com", "bigcorp.com", true, now);
    repositories.organizations().create(&organization).await.unwrap();
    let mut invitation = Invitation::new(organization.id, "late@newcorp.com", UserRole::Admin, now);
    invitation.expires_at = now - Duration::hours(1);
    repositories.invitations().create(&invitation).await.unwrap();

    let ended = email_sign_in(&harness, "late@newcorp.com", SignInStart::default()).await;
    let identity = harness
        .processor
        .verifier()
        .check_token(&ended.token)
        .await
        .unwrap();

    assert_ne!(identity.organization.id, organization.id);
    assert_eq!(identity.organization.domain, "newcorp.com");
    assert!(
        repositories
            .invitations()
            .get_by_email("late@newcorp.com")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_invitation_to_deleted_organization_is_refused() {
    let harness = harness();
    let repositories = harness.database.repositories();
    let now = Utc::now();

    let mut organization = Organization::new_trial("owner@bigcorp.com", "bigcorp.com", true, now);
    organization.deleted_at = Some(now);
    repositories.organizations().create(&organization).await.unwrap();
    let invitation = Invitation::new(organization.id, "guest@gmail.com", UserRole::Member, now);
    repositories.invitations().create(&invitation).await.unwrap();

    let started = harness
        .processor
        .start_email_sign_in("guest@gmail.com", SignInStart::default())
        .await
        .unwrap();
    let result = harness
        .processor
        .end_email_sign_in(
            started.sign_in_code_id,
            DEV_SIGN_IN_CODE,
            end_with(&started.state),
        )
        .await;

    assert_eq!(
        result.unwrap_err(),
        AuthError::UnauthorizedUser("organization is deleted".to_string())
    );
    // the aborted transaction left nothing behind
    assert!(
        repositories
            .invitations()
            .get_by_email("guest@gmail.com")
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        repositories
            .users()
            .get_by_email("guest@gmail.com")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_domain_sign_in_joins_existing_organization() {
    let harness = harness();

    let first = email_sign_in(&harness, "jane@acme.io", SignInStart::default()).await;
    let second = email_sign_in(&harness, "bob@acme.io", SignInStart::default()).await;

    let verifier = harness.processor.verifier();
    let jane = verifier.check_token(&first.token).await.unwrap();
    let bob = verifier.check_token(&second.token).await.unwrap();

    assert_eq!(bob.organization.id, jane.organization.id);
    assert_eq!(jane.user.role, UserRole::Admin);
    assert_eq!(bob.user.role, UserRole::Member);
}

#[tokio::test]
async fn test_personal_domains_never_share_an_organization() {
    let harness = harness();

    let first = email_sign_in(&harness, "jane@gmail.com", SignInStart::default()).await;
    let second = email_sign_in(&harness, "john@gmail.com", SignInStart::default()).await;

    let verifier = harness.processor.verifier();
    let jane = verifier.check_token(&first.token).await.unwrap();
    let john = verifier.check_token(&second.token).await.unwrap();

    assert_ne!(jane.organization.id, john.organization.id);
    assert_eq!(jane.organization.domain, "jane.gmail.com");
    assert!(!jane.organization.settings.domain_sign_in);
    assert_eq!(jane.organization.capacity.included, 0);
    assert_eq!(jane.organization.capacity.extra, 100);
    assert_eq!(john.user.role, UserRole::Admin);
}

#[tokio::test]
async fn test_closed_domain_gets_a_separate_trial() {
    let harness = harness();
    let repositories = harness.database.repositories();

    let mut organization = Organization::new_trial("ceo@acme.io", "acme.io", true, Utc::now());
    organization.settings.domain_sign_in = false;
    repositories.organizations().create(&organization).await.unwrap();

    let ended = email_sign_in(&harness, "bob@acme.io", SignInStart::default()).await;
    let identity = harness
        .processor
        .verifier()
        .check_token(&ended.token)
        .await
        .unwrap();

    assert_ne!(identity.organization.id, organization.id);
    assert_eq!(identity.organization.domain, "bob.acme.io");
    assert_eq!(identity.user.role, UserRole::Admin);
}

#[tokio::test]
async fn test_deleted_organization_releases_its_domain() {
    let harness = harness();
    let repositories = harness.database.repositories();

    let mut organization = Organization::new_trial("ceo@acme.io", "acme.io", true, Utc::now());
    organization.deleted_at = Some(Utc::now());
    repositories.organizations().create(&organization).await.unwrap();

    let ended = email_sign_in(&harness, "bob@acme.io", SignInStart::default()).await;
    let identity = harness
        .processor
        .verifier()
        .check_token(&ended.token)
        .await
        .unwrap();

    assert_ne!(identity.organization.id, organization.id);
    assert_eq!(identity.organization.domain, "acme.io");

    let released = repositories
        .organizations()
        .get_by_id(organization.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(released.domain, organization.released_domain());
}

#[tokio::test]
async fn test_deleted_user_is_anonymized_and_replaced() {
    let harness = harness();
    let repositories = harness.database.repositories();
    let now = Utc::now();

    let organization = Organization::new_trial("ceo@acme.io", "acme.io", true, now);
    repositories.organizations().create(&organization).await.unwrap();
    let mut deleted = User::new(
        organization.id,
        "Jane".to_string(),
        "https://img/jane.png".to_string(),
        "jane@acme.io".to_string(),
        UserRole::Admin,
        now,
    );
    deleted.deleted_at = Some(now);
    repositories.users().create(&deleted).await.unwrap();

    let ended = email_sign_in(&harness, "jane@acme.io", SignInStart::default()).await;
    let identity = harness
        .processor
        .verifier()
        .check_token(&ended.token)
        .await
        .unwrap();

    assert_ne!(identity.user.id, deleted.id);
    assert_eq!(identity.user.email, "jane@acme.io");
    assert_eq!(identity.user.role, UserRole::Member);

    let anonymized = repositories.users().get_by_id(deleted.id).await.unwrap().unwrap();
    assert_eq!(anonymized.email, format!("{}@deleted.user", deleted.id));
}

#[tokio::test]
async fn test_existing_user_gets_a_new_session() {
    let harness = harness();

    let first = email_sign_in(&harness, "jane@acme.io", SignInStart::default()).await;
    let second = email_sign_in(&harness, "jane@acme.io", SignInStart::default()).await;

    let verifier = harness.processor.verifier();
    let before = verifier.check_token(&first.token).await.unwrap();
    let after = verifier.check_token(&second.token).await.unwrap();

    assert_eq!(before.user.id, after.user.id);
    assert_ne!(before.session.id, after.session.id);
}

#[tokio::test]
async fn test_second_code_request_waits_for_expiry() {
    let harness = harness();
    let codes = harness.database.repositories().sign_in_codes();

    let first = harness
        .processor
        .start_email_sign_in("jane@acme.io", SignInStart::default())
        .await
        .unwrap();

    let again = harness
        .processor
        .start_email_sign_in("jane@acme.io", SignInStart::default())
        .await;
    assert_eq!(again.unwrap_err(), AuthError::SignInCodeAlreadyRequested);

    // age the first code past its expiry
    let mut stale = codes.get_by_id(first.sign_in_code_id).await.unwrap().unwrap();
    stale.expires_at = Utc::now() - Duration::seconds(1);
    codes.delete_by_id(stale.id).await.unwrap();
    codes.create(&stale).await.unwrap();

    let second = harness
        .processor
        .start_email_sign_in("jane@acme.io", SignInStart::default())
        .await
        .unwrap();
    assert_ne!(second.sign_in_code_id, first.sign_in_code_id);
    assert!(codes.get_by_id(first.sign_in_code_id).await.unwrap().is_none());

    let stale_attempt = harness
        .processor
        .end_email_sign_in(
            first.sign_in_code_id,
            DEV_SIGN_IN_CODE,
            end_with(&first.state),
        )
        .await;
    assert_eq!(
        stale_attempt.unwrap_err(),
        AuthError::InvalidSignInCode("no sign in code linked".to_string())
    );
}

#[tokio::test]
async fn test_attempts_are_capped() {
    let harness = harness();
    let codes = harness.database.repositories().sign_in_codes();

    let started = harness
        .processor
        .start_email_sign_in("jane@acme.io", SignInStart::default())
        .await
        .unwrap();

    let attempt = |code: &'static str| {
        harness.processor.end_email_sign_in(
            started.sign_in_code_id,
            code,
            end_with(&started.state),
        )
    };

    for _ in 0..3 {
        assert_eq!(
            attempt("WRONG1").await.unwrap_err(),
            AuthError::InvalidSignInCode("code doesn't match".to_string())
        );
    }
    assert_eq!(
        attempt("WRONG1").await.unwrap_err(),
        AuthError::InvalidSignInCode("max attempts reached".to_string())
    );
    assert_eq!(
        attempt(DEV_SIGN_IN_CODE).await.unwrap_err(),
        AuthError::InvalidSignInCode("max attempts reached".to_string())
    );

    let stored = codes.get_by_id(started.sign_in_code_id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 5);
}

#[tokio::test]
async fn test_concurrent_guesses_all_count() {
    let harness = harness();
    let codes = harness.database.repositories().sign_in_codes();

    let started = harness
        .processor
        .start_email_sign_in("jane@acme.io", SignInStart::default())
        .await
        .unwrap();

    let attempt = |code: &'static str| {
        harness.processor.end_email_sign_in(
            started.sign_in_code_id,
            code,
            end_with(&started.state),
        )
    };

    let (first, second, third) = tokio::join!(
        attempt("WRONG1"),
        attempt("WRONG2"),
        attempt("WRONG3")
    );
    for result in [first, second, third] {
        assert_eq!(
            result.unwrap_err(),
            AuthError::InvalidSignInCode("code doesn't match".to_string())
        );
    }

    let stored = codes.get_by_id(started.sign_in_code_id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 3);
    assert_eq!(
        attempt(DEV_SIGN_IN_CODE).await.unwrap_err(),
        AuthError::InvalidSignInCode("max attempts reached".to_string())
    );
}

#[tokio::test]
async fn test_expired_code_is_refused() {
    let harness = harness();
    let codes = harness.database.repositories().sign_in_codes();

    let mut expired = SignInCode::new("jane@acme.io", DEV_SIGN_IN_CODE.to_string(), Utc::now());
    expired.expires_at = Utc::now() - Duration::seconds(1);
    codes.create(&expired).await.unwrap();

    let started = harness
        .processor
        .start_oauth_sign_in("google", SignInStart::default())
        .unwrap();
    let result = harness
        .processor
        .end_email_sign_in(expired.id, DEV_SIGN_IN_CODE, end_with(&started.state))
        .await;

    assert_eq!(
        result.unwrap_err(),
        AuthError::InvalidSignInCode("sign in code expired".to_string())
    );
}

#[tokio::test]
async fn test_sign_in_email_carries_code_and_link() {
    let harness = harness();

    let started = harness
        .processor
        .start_email_sign_in("jane@acme.io", SignInStart::default())
        .await
        .unwrap();

    let sent = harness.email.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipients, vec!["jane@acme.io".to_string()]);
    assert!(sent[0].html_body.contains(DEV_SIGN_IN_CODE));

    let href_start = sent[0].html_body.find("href=\"").unwrap() + "href=\"".len();
    let href_end = href_start + sent[0].html_body[href_start..].find('"').unwrap();
    let link = Url::parse(&sent[0].html_body[href_start..href_end]).unwrap();
    let query: std::collections::HashMap<String, String> =
        link.query_pairs().into_owned().collect();

    assert_eq!(link.origin(), Url::parse(FRONTEND_BASE_URL).unwrap().origin());
    assert_eq!(link.path(), "/dash/signin/email/end");
    assert_eq!(query["id"], started.sign_in_code_id.to_string());
    assert_eq!(query["code"], DEV_SIGN_IN_CODE);
    assert_eq!(query["state"], started.state);
}

#[tokio::test]
async fn test_failed_dispatch_leaves_no_code() {
    let harness = harness();
    harness.email.fail(true);

    let result = harness
        .processor
        .start_email_sign_in("jane@acme.io", SignInStart::default())
        .await;
    assert!(matches!(result, Err(AuthError::Generic(_))));
    assert!(
        harness
            .database
            .repositories()
            .sign_in_codes()
            .get_by_email("jane@acme.io")
            .await
            .unwrap()
            .is_none()
    );

    harness.email.fail(false);
    assert!(
        harness
            .processor
            .start_email_sign_in("jane@acme.io", SignInStart::default())
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_invalid_emails_are_rejected() {
    let harness = harness();

    for email in ["not-an-email", "jane@", "jane@mailinator.com"] {
        let result = harness
            .processor
            .start_email_sign_in(email, SignInStart::default())
            .await;
        assert!(
            matches!(result, Err(AuthError::InvalidEmail(_))),
            "{email} should be rejected"
        );
    }
    assert!(harness.email.sent().is_empty());
}

#[tokio::test]
async fn test_production_codes_are_random() {
    let mut config = AuthConfig::new(support::CRYPT_KEY, FRONTEND_BASE_URL);
    config.environment = Environment::Production;
    let harness = harness_with(config);

    let started = harness
        .processor
        .start_email_sign_in("jane@acme.io", SignInStart::default())
        .await
        .unwrap();

    let stored = harness
        .database
        .repositories()
        .sign_in_codes()
        .get_by_id(started.sign_in_code_id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stored.code.len(), 6);
    assert!(
        stored
            .code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    );
    assert!(harness.email.sent()[0].html_body.contains(&stored.code));
}

#[tokio::test]
async fn test_states_must_match() {
    let harness = harness();

    let first = harness
        .processor
        .start_email_sign_in("jane@acme.io", SignInStart::default())
        .await
        .unwrap();
    let other = harness
        .processor
        .start_oauth_sign_in("google", SignInStart::default())
        .unwrap();

    let result = harness
        .processor
        .end_email_sign_in(
            first.sign_in_code_id,
            DEV_SIGN_IN_CODE,
            SignInEnd {
                start_state: first.state.clone(),
                end_state: other.state,
                ip: "203.0.113.7".to_string(),
                device: "Mozilla/5.0".to_string(),
            },
        )
        .await;

    assert_eq!(
        result.unwrap_err(),
        AuthError::InvalidState("state doesn't match".to_string())
    );
}

#[tokio::test]
async fn test_garbage_and_expired_states_are_refused() {
    let harness = harness();
    harness.google.set_profile(profile("jane@acme.io", None));

    let garbage = harness
        .processor
        .end_oauth_sign_in("google", &oauth_callback("garbage"), end_with("garbage"))
        .await;
    assert!(matches!(garbage, Err(AuthError::InvalidState(_))));

    let expired = State::new(None, None, Duration::seconds(-1), Utc::now());
    let expired = harness.codec.seal_state(&expired).unwrap();
    let result = harness
        .processor
        .end_oauth_sign_in("google", &oauth_callback(&expired), end_with(&expired))
        .await;
    assert_eq!(
        result.unwrap_err(),
        AuthError::InvalidState("state expired".to_string())
    );
}

#[tokio::test]
async fn test_redirect_must_stay_on_frontend_origin() {
    let harness = harness();

    let start = SignInStart {
        redirect_to: Some(format!("{}/projects/42", FRONTEND_BASE_URL)),
        current_token: None,
    };
    let ended = email_sign_in(&harness, "jane@acme.io", start).await;
    assert_eq!(
        ended.redirect_to.as_deref(),
        Some("https://app.acme.io/projects/42")
    );

    harness.google.set_profile(profile("jane@acme.io", None));
    let started = harness
        .processor
        .start_oauth_sign_in(
            "google",
            SignInStart {
                redirect_to: Some("https://evil.example/steal".to_string()),
                current_token: None,
            },
        )
        .unwrap();
    let result = harness
        .processor
        .end_oauth_sign_in(
            "google",
            &oauth_callback(&started.state),
            end_with(&started.state),
        )
        .await;

    assert!(matches!(result, Err(AuthError::InvalidState(_))));
}

#[tokio::test]
async fn test_oauth_provider_must_be_registered() {
    let harness = harness();

    for provider in ["github", "email", "amazon", "saml", ""] {
        let result = harness
            .processor
            .start_oauth_sign_in(provider, SignInStart::default());
        assert_eq!(
            result.unwrap_err(),
            AuthError::InvalidOAuthProvider(provider.to_string())
        );
    }

    let started = harness
        .processor
        .start_oauth_sign_in("Google", SignInStart::default())
        .unwrap();
    assert!(started.auth_url.contains(&started.state));
}

#[tokio::test]
async fn test_oauth_sign_in_creates_user() {
    let harness = harness();

    let ended = google_sign_in(
        &harness,
        profile("jane@newcorp.com", Some("Jane Doe")),
        SignInStart::default(),
    )
    .await;
    let identity = harness
        .processor
        .verifier()
        .check_token(&ended.token)
        .await
        .unwrap();

    assert_eq!(identity.session.provider, SessionProvider::Google);
    assert_eq!(identity.user.name, "Jane Doe");
    assert_eq!(identity.user.role, UserRole::Admin);
}

#[tokio::test]
async fn test_oauth_avatar_becomes_user_picture() {
    let harness = harness();

    let ended = google_sign_in(
        &harness,
        OAuthUser {
            avatar_url: Some("https://cdn.acme.io/jane.png".to_string()),
            ..profile("jane@newcorp.com", Some("Jane Doe"))
        },
        SignInStart::default(),
    )
    .await;
    let identity = harness
        .processor
        .verifier()
        .check_token(&ended.token)
        .await
        .unwrap();
    assert_eq!(identity.user.picture, "https://cdn.acme.io/jane.png");

    // blank avatars fall back to the default picture
    let ended = google_sign_in(
        &harness,
        OAuthUser {
            avatar_url: Some(" ".to_string()),
            ..profile("bob@othercorp.com", Some("Bob"))
        },
        SignInStart::default(),
    )
    .await;
    let identity = harness
        .processor
        .verifier()
        .check_token(&ended.token)
        .await
        .unwrap();
    assert_eq!(identity.user.picture, USER_DEFAULT_PICTURE);
}

#[tokio::test]
async fn test_oauth_name_fallbacks() {
    let cases = [
        (
            OAuthUser {
                email: Some("a@acme.io".to_string()),
                first_name: Some("Ann".to_string()),
                nickname: Some("annie".to_string()),
                ..OAuthUser::default()
            },
            "Ann",
        ),
        (
            OAuthUser {
                email: Some("b@acme.io".to_string()),
                name: Some("  ".to_string()),
                nickname: Some("bee".to_string()),
                ..OAuthUser::default()
            },
            "bee",
        ),
        (profile("carol.smith@acme.io", None), "carol.smith"),
    ];

    let harness = harness();
    for (profile, expected) in cases {
        let ended = google_sign_in(&harness, profile, SignInStart::default()).await;
        let identity = harness
            .processor
            .verifier()
            .check_token(&ended.token)
            .await
            .unwrap();
        assert_eq!(identity.user.name, expected);
    }
}

#[tokio::test]
async fn test_oauth_callback_failures() {
    let harness = harness();
    let started = harness
        .processor
        .start_oauth_sign_in("google", SignInStart::default())
        .unwrap();
    let end = || end_with(&started.state);

    let malformed = harness
        .processor
        .end_oauth_sign_in("google", "code=%zz", end())
        .await;
    assert!(matches!(malformed, Err(AuthError::InvalidOAuthResult(_))));

    let rejected = harness
        .processor
        .end_oauth_sign_in("google", "code=stolen", end())
        .await;
    assert!(matches!(rejected, Err(AuthError::InvalidOAuthResult(_))));

    harness.google.set_profile(OAuthUser {
        name: Some("No Mail".to_string()),
        ..OAuthUser::default()
    });
    let no_email = harness
        .processor
        .end_oauth_sign_in("google", &oauth_callback(&started.state), end())
        .await;
    assert_eq!(
        no_email.unwrap_err(),
        AuthError::InvalidOAuthResult("no email in profile".to_string())
    );

    harness.google.fail_profile();
    let unavailable = harness
        .processor
        .end_oauth_sign_in("google", &oauth_callback(&started.state), end())
        .await;
    assert!(matches!(unavailable, Err(AuthError::Generic(_))));
}

#[tokio::test]
async fn test_linking_switches_provider_of_the_session() {
    let harness = harness();
    let verifier = harness.processor.verifier();

    let email = email_sign_in(&harness, "jane@acme.io", SignInStart::default()).await;
    let before = verifier.check_token(&email.token).await.unwrap();

    let google = google_sign_in(
        &harness,
        profile("jane@acme.io", Some("Jane")),
        SignInStart {
            redirect_to: None,
            current_token: Some(email.token.clone()),
        },
    )
    .await;
    let after = verifier.check_token(&google.token).await.unwrap();

    assert_eq!(after.session.id, before.session.id);
    assert_eq!(after.session.provider, SessionProvider::Google);
    assert_eq!(after.user.id, before.user.id);
    assert_eq!(
        verifier.check_token(&email.token).await.unwrap_err(),
        AuthError::InvalidToken("provider doesn't match".to_string())
    );
}

#[tokio::test]
async fn test_linking_refuses_another_email() {
    let harness = harness();

    let email = email_sign_in(&harness, "jane@acme.io", SignInStart::default()).await;

    harness
        .google
        .set_profile(profile("someone.else@acme.io", None));
    let started = harness
        .processor
        .start_oauth_sign_in(
            "google",
            SignInStart {
                redirect_to: None,
                current_token: Some(email.token),
            },
        )
        .unwrap();
    let result = harness
        .processor
        .end_oauth_sign_in(
            "google",
            &oauth_callback(&started.state),
            end_with(&started.state),
        )
        .await;

    assert_eq!(
        result.unwrap_err(),
        AuthError::InvalidState("multiple emails for the same user not supported".to_string())
    );
}

#[tokio::test]
async fn test_linking_ignores_invalid_previous_token() {
    let harness = harness();

    let ended = email_sign_in(
        &harness,
        "jane@acme.io",
        SignInStart {
            redirect_to: None,
            current_token: Some("v4.local.not-a-token".to_string()),
        },
    )
    .await;

    assert!(
        harness
            .processor
            .verifier()
            .check_token(&ended.token)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_linking_with_token_of_deleted_user_is_refused() {
    let harness = harness();
    let repositories = harness.database.repositories();
    let now = Utc::now();

    let organization = Organization::new_trial("ceo@acme.io", "acme.io", true, now);
    repositories.organizations().create(&organization).await.unwrap();
    let mut user = User::new(
        organization.id,
        "Jane".to_string(),
        "https://img/jane.png".to_string(),
        "jane@acme.io".to_string(),
        UserRole::Member,
        now,
    );
    user.deleted_at = Some(now);
    repositories.users().create(&user).await.unwrap();
    let session = Session::new(
        user.id,
        SessionProvider::Email,
        SessionLocation {
            ip: "203.0.113.7".to_string(),
            device: "Mozilla/5.0".to_string(),
        },
        now,
    );
    repositories.sessions().create(&session).await.unwrap();
    let token = Token::new(session.id, session.provider, Duration::hours(1), now);
    let token = harness.codec.seal_token(&token).unwrap();

    harness.google.set_profile(profile("jane@acme.io", None));
    let started = harness
        .processor
        .start_oauth_sign_in(
            "google",
            SignInStart {
                redirect_to: None,
                current_token: Some(token),
            },
        )
        .unwrap();
    let result = harness
        .processor
        .end_oauth_sign_in(
            "google",
            &oauth_callback(&started.state),
            end_with(&started.state),
        )
        .await;

    assert_eq!(
        result.unwrap_err(),
        AuthError::UnauthorizedUser("user is deleted".to_string())
    );
}

#[tokio::test]
async fn test_sign_out_expires_session() {
    let harness = harness();
    let verifier = harness.processor.verifier();

    let ended = email_sign_in(&harness, "jane@acme.io", SignInStart::default()).await;
    let identity = verifier.check_token(&ended.token).await.unwrap();

    harness.processor.sign_out(&identity.session).await.unwrap();

    assert_eq!(
        verifier.check_token(&ended.token).await.unwrap_err(),
        AuthError::InvalidToken("session expired".to_string())
    );
}

#[tokio::test]
async fn test_saml_is_not_implemented() {
    let harness = harness();
    let not_implemented = AuthError::Generic("SAML not implemented".to_string());

    assert_eq!(
        harness
            .processor
            .start_saml_sign_in(SignInStart::default())
            .unwrap_err(),
        not_implemented
    );
    assert_eq!(
        harness
            .processor
            .end_saml_sign_in(end_with("state"))
            .await
            .unwrap_err(),
        not_implemented
    );
}

#[tokio::test]
async fn test_dispatch_routes_each_method() {
    let harness = harness();

    let started = harness
        .processor
        .start_sign_in(
            SignInMethod::Email {
                email: "jane@acme.io".to_string(),
            },
            SignInStart::default(),
        )
        .await
        .unwrap();
    let SignInStarted::Email(email) = started else {
        panic!("expected an e-mail sign-in");
    };

    let ended = harness
        .processor
        .end_sign_in(
            SignInProof::Email {
                sign_in_code_id: email.sign_in_code_id,
                code: DEV_SIGN_IN_CODE.to_string(),
            },
            end_with(&email.state),
        )
        .await
        .unwrap();
    assert!(
        harness
            .processor
            .verifier()
            .check_token(&ended.token)
            .await
            .is_ok()
    );

    let redirect = harness
        .processor
        .start_sign_in(
            SignInMethod::OAuth {
                provider: "google".to_string(),
            },
            SignInStart::default(),
        )
        .await
        .unwrap();
    assert!(matches!(redirect, SignInStarted::Redirect(_)));

    harness.google.set_profile(profile("bob@acme.io", None));
    let SignInStarted::Redirect(redirect) = redirect else {
        unreachable!()
    };
    let ended = harness
        .processor
        .end_sign_in(
            SignInProof::OAuth {
                provider: "google".to_string(),
                auth_result: oauth_callback(&redirect.state),
            },
            end_with(&redirect.state),
        )
        .await;
    assert!(ended.is_ok());

    let saml = harness
        .processor
        .start_sign_in(SignInMethod::Saml, SignInStart::default())
        .await;
    assert!(matches!(saml, Err(AuthError::Generic(_))));
    let saml = harness
        .processor
        .end_sign_in(SignInProof::Saml, end_with("state"))
        .await;
    assert!(matches!(saml, Err(AuthError::Generic(_))));
}
