mod common;

use std::time::Duration;

use common::TestApp;
use identity_service::models::{
    ChallengeType, Identifier, IdentifierType, LoginOutcome, UserIdentity, VerificationOutcome,
};
use identity_service::services::{
    provider::{FlowProgress, Traits},
    ChallengeStore, ErrorKind, IdentityProvider, IdentitySettings, RateLimitAction, RateLimiter,
    ServiceError, MOCK_VALID_CODE,
};
use secrecy::SecretString;
use uuid::Uuid;

// ==================== Registration ====================

#[tokio::test]
async fn register_then_verify_binds_exactly_one_identity() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;

    let started = app
        .service
        .register(tenant.tenant_id, "+84344381024", Some("en"))
        .await
        .unwrap();
    assert_eq!(started.identifier_type, IdentifierType::Phone);
    assert_eq!(started.expires_in, 300);

    let result = app
        .service
        .verify_register(tenant.tenant_id, &started.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap();

    assert!(result.active);
    assert!(result.session_token.is_some());
    assert_eq!(result.user.phone.as_deref(), Some("+84344381024"));
    assert_eq!(result.user.lang.as_deref(), Some("en"));
    assert_eq!(app.store.identity_count(), 1);
    assert_eq!(app.store.global_user_count(), 1);

    let token = result.session_token.unwrap();
    let first = app.service.profile(tenant.tenant_id, &token).await.unwrap();
    let second = app.service.profile(tenant.tenant_id, &token).await.unwrap();
    assert_eq!(first.global_user_id, result.user.global_user_id);
    assert_eq!(second.global_user_id, result.user.global_user_id);
}

#[tokio::test]
async fn registering_a_bound_identifier_again_is_rejected() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    app.register_user(&tenant, "a@example.com").await;

    let err = app
        .service
        .register(tenant.tenant_id, "A@Example.com", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AlreadyRegistered));
    assert_eq!(app.store.identity_count(), 1);
}

#[tokio::test]
async fn registration_clears_binding_of_deleted_provider_identity() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let first = app.register_user(&tenant, "a@example.com").await;

    app.provider.forget_identity(&first.user.tenant_user_id);

    let second = app.register_user(&tenant, "a@example.com").await;
    assert_ne!(second.user.tenant_user_id, first.user.tenant_user_id);
    assert_eq!(app.store.identity_count(), 1);

    let identifier = Identifier::parse("a@example.com").unwrap();
    let row = identity_service::services::IdentityStore::find_identity(
        app.store.as_ref(),
        tenant.tenant_id,
        &identifier,
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(row.provider_user_id, second.user.tenant_user_id);
}

#[tokio::test]
async fn registration_clears_row_whose_provider_trait_is_gone() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let user = app.register_user(&tenant, "+84344381024").await;

    // A stale email row pointing at an identity that never carried the email.
    let stale = UserIdentity::new(
        user.user.global_user_id,
        tenant.tenant_id,
        user.user.tenant_user_id.clone(),
        &Identifier::parse("a@example.com").unwrap(),
    );
    app.store.insert_identity_row(stale).unwrap();
    assert_eq!(app.store.identity_count(), 2);

    let registered = app.register_user(&tenant, "a@example.com").await;
    assert_ne!(registered.user.global_user_id, user.user.global_user_id);
    assert_eq!(app.store.identity_count(), 2);
}

#[tokio::test]
async fn failed_bind_leaves_provider_orphan_that_next_registration_removes() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;

    let started = app
        .service
        .register(tenant.tenant_id, "a@example.com", None)
        .await
        .unwrap();
    app.store.fail_on("bind_identity");

    let err = app
        .service
        .verify_register(tenant.tenant_id, &started.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::IamRegistrationFailed(_)));
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(app.provider.identity_count(), 1);
    assert_eq!(app.store.identity_count(), 0);
    assert!(app.provider.calls().contains(&"revoke_session"));

    app.store.clear_failures();
    let orphan = app.provider_identity(&tenant, "a@example.com").await.unwrap();
    app.provider
        .backdate_identity(&orphan.id, chrono::Duration::seconds(301));
    let registered = app.register_user(&tenant, "a@example.com").await;

    assert!(app.provider.calls().contains(&"delete_identity"));
    assert!(app.provider.identity(&orphan.id).is_none());
    assert_ne!(registered.user.tenant_user_id, orphan.id);
    assert_eq!(app.provider.identity_count(), 1);
    assert_eq!(app.store.identity_count(), 1);
}

#[tokio::test]
async fn registration_leaves_another_tenants_identity_on_a_shared_provider() {
    let app = TestApp::new();
    let first = app.tenant_on("acme", "shared").await;
    let second = app.tenant_on("globex", "shared").await;
    let owner = app.register_user(&first, "a@b.com").await;
    app.provider.clear_calls();

    let err = app
        .service
        .register(second.tenant_id, "a@b.com", None)
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::AlreadyRegistered));
    assert!(!app.provider.calls().contains(&"delete_identity"));
    assert!(app.provider.identity(&owner.user.tenant_user_id).is_some());
    let outcome = app
        .service
        .login(first.tenant_id, "a@b.com", None)
        .await
        .unwrap();
    assert!(matches!(outcome, LoginOutcome::ChallengeSent(_)));
}

#[tokio::test]
async fn registration_waits_for_a_confirmation_that_has_not_bound_yet() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let ep = tenant.endpoints();
    let identifier = Identifier::parse("a@b.com").unwrap();
    let traits = Traits::for_registration(&identifier, &tenant.tenant_id.to_string(), None);

    // The provider side of a confirmation, stopped before the store bind.
    let flow = app.provider.registration_initialize(&ep).await.unwrap();
    let progress = app
        .provider
        .registration_submit(&ep, &flow.id, &traits, Some(MOCK_VALID_CODE))
        .await
        .unwrap();
    let FlowProgress::Completed(session) = progress else {
        panic!("registration did not complete");
    };
    let pending = session.identity.id;

    let err = app
        .service
        .register(tenant.tenant_id, "a@b.com", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::FlowConflict(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(app.provider.identity(&pending).is_some());

    // Once a challenge lifetime has passed nothing can still bind it.
    app.provider
        .backdate_identity(&pending, chrono::Duration::seconds(301));
    app.service
        .register(tenant.tenant_id, "a@b.com", None)
        .await
        .unwrap();
    assert!(app.provider.identity(&pending).is_none());
}

#[tokio::test]
async fn wrong_code_consumes_the_challenge() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let started = app
        .service
        .register(tenant.tenant_id, "a@example.com", None)
        .await
        .unwrap();

    let err = app
        .service
        .verify_register(tenant.tenant_id, &started.flow_id, "111111")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ProviderRejected(_)));

    let err = app
        .service
        .verify_register(tenant.tenant_id, &started.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SessionNotFound));
    assert_eq!(app.store.identity_count(), 0);
}

#[tokio::test]
async fn challenge_is_scoped_to_its_tenant() {
    let app = TestApp::new();
    let home = app.tenant("home").await;
    let other = app.tenant("other").await;
    let started = app
        .service
        .register(home.tenant_id, "a@example.com", None)
        .await
        .unwrap();

    let err = app
        .service
        .verify_register(other.tenant_id, &started.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SessionNotFound));
}

#[tokio::test]
async fn same_identifier_in_another_tenant_resolves_to_the_same_global_user() {
    let app = TestApp::new();
    let first = app.tenant("first").await;
    let second = app.tenant("second").await;

    let a = app.register_user(&first, "a@example.com").await;
    let b = app.register_user(&second, "a@example.com").await;

    assert_eq!(a.user.global_user_id, b.user.global_user_id);
    assert_ne!(a.user.tenant_user_id, b.user.tenant_user_id);
    assert_eq!(app.store.global_user_count(), 1);
}

#[tokio::test]
async fn unknown_tenant_and_bad_identifiers_are_rejected() {
    let app = TestApp::new();
    let err = app
        .service
        .register(Uuid::new_v4(), "a@example.com", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::TenantNotFound));

    let tenant = app.tenant("acme").await;
    let err = app
        .service
        .register(tenant.tenant_id, "not an identifier", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(app.provider.calls().is_empty());
}

// ==================== Login ====================

#[tokio::test]
async fn code_login_round_trip() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let registered = app.register_user(&tenant, "a@example.com").await;

    let outcome = app
        .service
        .login(tenant.tenant_id, "a@example.com", None)
        .await
        .unwrap();
    let LoginOutcome::ChallengeSent(started) = outcome else {
        panic!("expected a code challenge");
    };

    let result = app
        .service
        .verify_login(tenant.tenant_id, &started.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap();
    assert_eq!(result.user.global_user_id, registered.user.global_user_id);
    assert!(result.session_token.is_some());
}

#[tokio::test]
async fn password_login_authenticates_directly() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let registered = app.register_user(&tenant, "a@example.com").await;
    app.provider
        .set_password(&registered.user.tenant_user_id, "correct horse");

    let outcome = app
        .service
        .login(
            tenant.tenant_id,
            "a@example.com",
            Some(SecretString::new("correct horse".to_string())),
        )
        .await
        .unwrap();
    let LoginOutcome::Authenticated(result) = outcome else {
        panic!("expected a session");
    };
    assert_eq!(result.user.global_user_id, registered.user.global_user_id);

    let err = app
        .service
        .login(
            tenant.tenant_id,
            "a@example.com",
            Some(SecretString::new("wrong".to_string())),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ProviderRejected(_)));
}

#[tokio::test]
async fn login_with_unbound_identifier_is_not_found() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;

    let err = app
        .service
        .login(tenant.tenant_id, "ghost@example.com", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::IdentityNotFound));
}

#[tokio::test]
async fn challenge_verification_dispatches_on_challenge_type() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    app.register_user(&tenant, "+84344381024").await;

    let started = app
        .service
        .challenge_with_phone(tenant.tenant_id, "+84344381024")
        .await
        .unwrap();
    let outcome = app
        .service
        .challenge_verification(tenant.tenant_id, &started.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap();
    assert!(matches!(outcome, VerificationOutcome::Login(_)));

    let started = app
        .service
        .register(tenant.tenant_id, "b@example.com", None)
        .await
        .unwrap();
    let outcome = app
        .service
        .challenge_verification(tenant.tenant_id, &started.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap();
    assert!(matches!(outcome, VerificationOutcome::Register(_)));
}

#[tokio::test]
async fn email_challenge_refuses_a_phone_number() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;

    let err = app
        .service
        .challenge_with_email(tenant.tenant_id, "+84344381024")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn verify_login_refuses_a_registration_challenge() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let started = app
        .service
        .register(tenant.tenant_id, "a@example.com", None)
        .await
        .unwrap();

    let err = app
        .service
        .verify_login(tenant.tenant_id, &started.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SessionNotFound));
}

// ==================== Rate Limiting ====================

#[tokio::test]
async fn attempts_beyond_the_window_limit_are_refused() {
    let app = TestApp::with_settings(IdentitySettings {
        max_attempts: 2,
        ..IdentitySettings::default()
    });
    let tenant = app.tenant("acme").await;

    for _ in 0..2 {
        app.service
            .register(tenant.tenant_id, "a@example.com", None)
            .await
            .unwrap();
    }
    let err = app
        .service
        .register(tenant.tenant_id, "a@example.com", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::RateLimitExceeded { retry_after: 300 }
    ));

    // Other identifiers keep their own budget.
    app.service
        .register(tenant.tenant_id, "b@example.com", None)
        .await
        .unwrap();
}

#[tokio::test]
async fn limiter_counts_per_key() {
    let app = TestApp::new();
    let tenant = Uuid::new_v4();
    let key = RateLimitAction::Login.key(tenant, "a@example.com");
    let other = RateLimitAction::Login.key(tenant, "b@example.com");
    let window = Duration::from_secs(300);

    for _ in 0..5 {
        app.limiter.register_attempt(&key, window).await.unwrap();
    }
    assert!(app.limiter.is_limited(&key, 5, window).await.unwrap());
    assert!(!app.limiter.is_limited(&other, 5, window).await.unwrap());
}

#[tokio::test]
async fn successful_verification_resets_its_attempts() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let started = app
        .service
        .register(tenant.tenant_id, "a@example.com", None)
        .await
        .unwrap();
    app.service
        .verify_register(tenant.tenant_id, &started.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap();

    let key = RateLimitAction::VerifyRegister.key(tenant.tenant_id, &started.flow_id);
    assert!(!app
        .limiter
        .is_limited(&key, 1, Duration::from_secs(300))
        .await
        .unwrap());
}

// ==================== Identifier Management ====================

#[tokio::test]
async fn end_to_end_phone_registration_then_added_email() {
    let app = TestApp::new();
    let tenant = app.tenant("T1").await;

    let started = app
        .service
        .register(tenant.tenant_id, "+84344381024", Some("en"))
        .await
        .unwrap();
    let registered = app
        .service
        .verify_register(tenant.tenant_id, &started.flow_id, "000000")
        .await
        .unwrap();
    assert!(registered.active);
    assert_eq!(registered.user.phone.as_deref(), Some("+84344381024"));

    let added = app
        .service
        .add_new_identifier(
            tenant.tenant_id,
            registered.user.global_user_id,
            &registered.user.tenant_user_id,
            "a@b.com",
        )
        .await
        .unwrap();
    let confirmed = app
        .service
        .verify_register(tenant.tenant_id, &added.flow_id, "000000")
        .await
        .unwrap();
    assert!(confirmed.session_token.is_none());

    let token = registered.session_token.unwrap();
    let profile = app.service.profile(tenant.tenant_id, &token).await.unwrap();
    assert_eq!(profile.global_user_id, registered.user.global_user_id);
    assert_eq!(profile.phone.as_deref(), Some("+84344381024"));
    assert_eq!(profile.email.as_deref(), Some("a@b.com"));

    let identity = app
        .provider
        .identity(&registered.user.tenant_user_id)
        .unwrap();
    assert_eq!(identity.traits.email.as_deref(), Some("a@b.com"));
}

#[tokio::test]
async fn adding_a_second_identifier_of_the_same_type_is_rejected() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let user = app.register_user(&tenant, "a@example.com").await;

    let err = app
        .service
        .add_new_identifier(
            tenant.tenant_id,
            user.user.global_user_id,
            &user.user.tenant_user_id,
            "b@example.com",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::IdentifierTypeAlreadyBound));
}

#[tokio::test]
async fn failed_bind_of_added_identifier_removes_the_provider_trait() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let user = app.register_user(&tenant, "+84344381024").await;

    let started = app
        .service
        .add_new_identifier(
            tenant.tenant_id,
            user.user.global_user_id,
            &user.user.tenant_user_id,
            "a@example.com",
        )
        .await
        .unwrap();
    app.store.fail_on("bind_identity");

    let err = app
        .service
        .verify_register(tenant.tenant_id, &started.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    let identity = app.provider.identity(&user.user.tenant_user_id).unwrap();
    assert_eq!(identity.traits.email, None);
    assert_eq!(identity.traits.phone.as_deref(), Some("+84344381024"));
}

#[tokio::test]
async fn change_to_an_identifier_owned_by_someone_else_makes_no_provider_calls() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let alice = app.register_user(&tenant, "alice@example.com").await;
    app.register_user(&tenant, "bob@example.com").await;
    app.provider.clear_calls();

    let err = app
        .service
        .change_identifier(
            tenant.tenant_id,
            alice.user.global_user_id,
            &alice.user.tenant_user_id,
            "bob@example.com",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::IdentifierAlreadyExists));
    assert!(app.provider.calls().is_empty());
}

#[tokio::test]
async fn changed_identifier_replaces_the_old_one_for_login() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let user = app.register_user(&tenant, "old@example.com").await;

    let phone = app
        .service
        .add_new_identifier(
            tenant.tenant_id,
            user.user.global_user_id,
            &user.user.tenant_user_id,
            "+84344381024",
        )
        .await
        .unwrap();
    app.service
        .verify_register(tenant.tenant_id, &phone.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap();

    let started = app
        .service
        .change_identifier(
            tenant.tenant_id,
            user.user.global_user_id,
            &user.user.tenant_user_id,
            "new@example.com",
        )
        .await
        .unwrap();
    let outcome = app
        .service
        .challenge_verification(tenant.tenant_id, &started.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap();
    let VerificationOutcome::ChangeIdentifier(changed) = outcome else {
        panic!("expected a changed user");
    };
    assert_eq!(changed.email.as_deref(), Some("new@example.com"));
    assert_eq!(changed.phone.as_deref(), Some("+84344381024"));

    let err = app
        .service
        .login(tenant.tenant_id, "old@example.com", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::IdentityNotFound));

    let outcome = app
        .service
        .login(tenant.tenant_id, "new@example.com", None)
        .await
        .unwrap();
    assert!(matches!(outcome, LoginOutcome::ChallengeSent(_)));

    let outcome = app
        .service
        .login(tenant.tenant_id, "+84344381024", None)
        .await
        .unwrap();
    assert!(matches!(outcome, LoginOutcome::ChallengeSent(_)));
}

#[tokio::test]
async fn change_to_another_type_converts_the_only_identifier() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let user = app.register_user(&tenant, "+84344381024").await;

    let started = app
        .service
        .change_identifier(
            tenant.tenant_id,
            user.user.global_user_id,
            &user.user.tenant_user_id,
            "a@example.com",
        )
        .await
        .unwrap();
    let outcome = app
        .service
        .challenge_verification(tenant.tenant_id, &started.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap();
    let VerificationOutcome::ChangeIdentifier(changed) = outcome else {
        panic!("expected a changed user");
    };
    assert_eq!(changed.email.as_deref(), Some("a@example.com"));
    assert_eq!(changed.phone, None);
    assert_eq!(app.store.identity_count(), 1);

    let identity = app.provider.identity(&user.user.tenant_user_id).unwrap();
    assert_eq!(identity.traits.email.as_deref(), Some("a@example.com"));
    assert_eq!(identity.traits.phone, None);
}

#[tokio::test]
async fn store_failure_during_change_rolls_the_provider_back() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let user = app.register_user(&tenant, "old@example.com").await;

    let started = app
        .service
        .change_identifier(
            tenant.tenant_id,
            user.user.global_user_id,
            &user.user.tenant_user_id,
            "new@example.com",
        )
        .await
        .unwrap();
    app.store.fail_on("replace_identity");

    let err = app
        .service
        .challenge_verification(tenant.tenant_id, &started.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(!matches!(err, ServiceError::Inconsistent(_)));

    let identity = app.provider.identity(&user.user.tenant_user_id).unwrap();
    assert_eq!(identity.traits.email.as_deref(), Some("old@example.com"));
}

#[tokio::test]
async fn failed_rollback_is_reported_as_inconsistent() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let user = app.register_user(&tenant, "old@example.com").await;

    let started = app
        .service
        .change_identifier(
            tenant.tenant_id,
            user.user.global_user_id,
            &user.user.tenant_user_id,
            "new@example.com",
        )
        .await
        .unwrap();
    app.store.fail_on("replace_identity");
    app.provider.fail_after("update_identifier_trait", 1);

    let err = app
        .service
        .challenge_verification(tenant.tenant_id, &started.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Inconsistent(_)));
    assert_eq!(err.code(), "inconsistent_state");
}

#[tokio::test]
async fn deleting_the_only_identifier_leaves_everything_unchanged() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let user = app.register_user(&tenant, "a@example.com").await;
    app.provider.clear_calls();

    let err = app
        .service
        .delete_identifier(
            tenant.tenant_id,
            user.user.global_user_id,
            &user.user.tenant_user_id,
            IdentifierType::Email,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::CannotDeleteOnlyIdentifier));
    assert_eq!(app.store.identity_count(), 1);
    assert!(app.provider.calls().is_empty());
}

#[tokio::test]
async fn deleting_one_of_two_identifiers_removes_provider_trait_then_row() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let user = app.register_user(&tenant, "a@example.com").await;
    let phone = app
        .service
        .add_new_identifier(
            tenant.tenant_id,
            user.user.global_user_id,
            &user.user.tenant_user_id,
            "+84344381024",
        )
        .await
        .unwrap();
    app.service
        .verify_register(tenant.tenant_id, &phone.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap();

    let remaining = app
        .service
        .delete_identifier(
            tenant.tenant_id,
            user.user.global_user_id,
            &user.user.tenant_user_id,
            IdentifierType::Email,
        )
        .await
        .unwrap();
    assert_eq!(remaining.email, None);
    assert_eq!(remaining.phone.as_deref(), Some("+84344381024"));
    assert_eq!(app.store.identity_count(), 1);

    let identity = app.provider.identity(&user.user.tenant_user_id).unwrap();
    assert_eq!(identity.traits.email, None);
}

#[tokio::test]
async fn provider_failure_on_delete_keeps_the_store_row() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let user = app.register_user(&tenant, "a@example.com").await;
    let phone = app
        .service
        .add_new_identifier(
            tenant.tenant_id,
            user.user.global_user_id,
            &user.user.tenant_user_id,
            "+84344381024",
        )
        .await
        .unwrap();
    app.service
        .verify_register(tenant.tenant_id, &phone.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap();
    app.provider.fail_on("delete_identifier");

    let err = app
        .service
        .delete_identifier(
            tenant.tenant_id,
            user.user.global_user_id,
            &user.user.tenant_user_id,
            IdentifierType::Email,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(app.store.identity_count(), 2);
}

// ==================== Sessions ====================

#[tokio::test]
async fn update_lang_writes_provider_and_mapping() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let user = app.register_user(&tenant, "a@example.com").await;
    let token = user.session_token.unwrap();

    let updated = app
        .service
        .update_lang(tenant.tenant_id, &token, "vi")
        .await
        .unwrap();
    assert_eq!(updated.lang.as_deref(), Some("vi"));

    let identity = app.provider.identity(&user.user.tenant_user_id).unwrap();
    assert_eq!(identity.traits.lang.as_deref(), Some("vi"));

    let err = app
        .service
        .update_lang(tenant.tenant_id, &token, "!!")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn refresh_keeps_the_token_and_logout_ends_it() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let user = app.register_user(&tenant, "a@example.com").await;
    let token = user.session_token.unwrap();

    let refreshed = app
        .service
        .refresh_token(tenant.tenant_id, &token)
        .await
        .unwrap();
    assert_eq!(refreshed.session_token.as_deref(), Some(token.as_str()));
    assert!(refreshed.expires_at.is_some());

    app.service.logout(tenant.tenant_id, &token).await.unwrap();

    let err = app.service.profile(tenant.tenant_id, &token).await.unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));
}

#[tokio::test]
async fn session_operations_load_the_tenant_once() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let user = app.register_user(&tenant, "a@example.com").await;
    let token = user.session_token.unwrap();
    let tenant_loads = |calls: Vec<&str>| calls.iter().filter(|c| **c == "get_tenant").count();

    app.store.clear_calls();
    app.service
        .update_lang(tenant.tenant_id, &token, "vi")
        .await
        .unwrap();
    assert_eq!(tenant_loads(app.store.calls()), 1);

    app.store.clear_calls();
    app.service
        .refresh_token(tenant.tenant_id, &token)
        .await
        .unwrap();
    assert_eq!(tenant_loads(app.store.calls()), 1);

    app.store.clear_calls();
    app.service.logout(tenant.tenant_id, &token).await.unwrap();
    assert_eq!(tenant_loads(app.store.calls()), 1);
}

#[tokio::test]
async fn logout_ends_a_session_whose_binding_is_gone() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let user = app.register_user(&tenant, "a@example.com").await;
    let token = user.session_token.unwrap();
    identity_service::services::IdentityStore::delete_orphan_binding(
        app.store.as_ref(),
        tenant.tenant_id,
        &user.user.tenant_user_id,
    )
    .await
    .unwrap();
    app.provider.clear_calls();

    app.service.logout(tenant.tenant_id, &token).await.unwrap();

    assert!(app.provider.calls().contains(&"logout"));
    let err = app.service.logout(tenant.tenant_id, &token).await.unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));
}

#[tokio::test]
async fn session_of_another_tenant_is_not_a_principal_here() {
    let app = TestApp::new();
    let home = app.tenant("home").await;
    let other = app.tenant("other").await;
    let user = app.register_user(&home, "a@example.com").await;

    let err = app
        .service
        .resolve_principal(other.tenant_id, &user.session_token.unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));
}

// ==================== Tenants ====================

#[tokio::test]
async fn tenant_with_bound_users_cannot_be_deleted() {
    let app = TestApp::new();
    let busy = app.tenant("busy").await;
    let empty = app.tenant("empty").await;
    app.register_user(&busy, "a@example.com").await;

    let err = app.service.delete_tenant(busy.tenant_id).await.unwrap_err();
    assert!(matches!(err, ServiceError::TenantHasDependents));

    app.service.delete_tenant(empty.tenant_id).await.unwrap();
    let err = app.service.get_tenant(empty.tenant_id).await.unwrap_err();
    assert!(matches!(err, ServiceError::TenantNotFound));
}

#[tokio::test]
async fn challenge_sessions_are_removed_once_consumed() {
    let app = TestApp::new();
    let tenant = app.tenant("acme").await;
    let started = app
        .service
        .register(tenant.tenant_id, "a@example.com", None)
        .await
        .unwrap();

    let pending = app.challenges.get(&started.flow_id).await.unwrap().unwrap();
    assert_eq!(pending.challenge_type, ChallengeType::Register);

    app.service
        .verify_register(tenant.tenant_id, &started.flow_id, MOCK_VALID_CODE)
        .await
        .unwrap();
    assert!(app.challenges.is_empty());
}
