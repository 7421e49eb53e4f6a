use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Connect to the test database and run all migrations. Returns `None` when
/// `TEST_DATABASE_URL` is unset so database tests skip on machines without
/// Postgres.
#[allow(dead_code)]
pub async fn setup_test_db() -> Option<PgPool> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping database test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("Failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    Some(pool)
}

/// Seed a follower with copying enabled. Each test uses its own ids so
/// tests sharing the database do not interfere.
#[allow(dead_code)]
pub async fn seed_follower(pool: &PgPool, follower_id: i64, token_balance: Decimal) {
    sqlx::query("DELETE FROM positions WHERE follower_id = $1")
        .bind(follower_id)
        .execute(pool)
        .await
        .expect("Failed to clean positions");
    sqlx::query("DELETE FROM follower_connections WHERE follower_id = $1")
        .bind(follower_id)
        .execute(pool)
        .await
        .expect("Failed to clean connections");

    sqlx::query(
        r#"
        INSERT INTO followers (id, copytrading_enabled, token_balance)
        VALUES ($1, true, $2)
        ON CONFLICT (id) DO UPDATE SET copytrading_enabled = true, token_balance = $2
        "#,
    )
    .bind(follower_id)
    .bind(token_balance)
    .execute(pool)
    .await
    .expect("Failed to seed follower");
}

/// Seed an active connection with plaintext secrets.
#[allow(dead_code)]
pub async fn seed_connection(pool: &PgPool, follower_id: i64, exchange: &str, strategy_tag: &str) {
    sqlx::query(
        r#"
        INSERT INTO follower_connections
            (follower_id, exchange, strategy_tag, api_key_enc, api_secret_enc, reserved_capital, risk_pct, is_active)
        VALUES ($1, $2, $3, 'follower-key-0001', 'follower-secret', 1000, 0.1, true)
        "#,
    )
    .bind(follower_id)
    .bind(exchange)
    .bind(strategy_tag)
    .execute(pool)
    .await
    .expect("Failed to seed connection");
}

#[allow(dead_code)]
pub fn d(s: &str) -> Decimal {
    s.parse().expect("valid decimal")
}
