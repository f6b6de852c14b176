//! USD price oracle client.

mod client;
mod error;
mod types;

pub use client::PriceOracleClient;
pub use error::PriceOracleError;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SOL: &str = "So11111111111111111111111111111111111111112";
    const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn create_test_client(mock_server: &MockServer) -> PriceOracleClient {
        PriceOracleClient::new(mock_server.uri(), None, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_prices_success() {
        let mock_server = MockServer::start().await;

        let body = serde_json::json!({
            "data": {
                SOL: { "id": SOL, "type": "derivedPrice", "price": "151.25" },
                USDC: { "id": USDC, "type": "derivedPrice", "price": 1.0001 }
            },
            "timeTaken": 0.003
        });

        Mock::given(method("GET"))
            .and(path("/price"))
            .and(query_param("ids", format!("{},{}", SOL, USDC)))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let prices = client
            .prices(&[SOL.to_string(), USDC.to_string()])
            .await
            .unwrap();

        assert_eq!(prices.len(), 2);
        assert!((prices[SOL] - 151.25).abs() < f64::EPSILON);
        assert!((prices[USDC] - 1.0001).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_prices_are_skipped() {
        let mock_server = MockServer::start().await;

        let body = serde_json::json!({
            "data": {
                SOL: null,
                USDC: { "id": USDC, "price": "not-a-number" }
            }
        });

        Mock::given(method("GET"))
            .and(path("/price"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let prices = client
            .prices(&[SOL.to_string(), USDC.to_string()])
            .await
            .unwrap();

        assert!(prices.is_empty());
    }

    #[tokio::test]
    async fn test_api_key_header() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/price"))
            .and(header("x-api-key", "oracle-key"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": {} })),
            )
            .mount(&mock_server)
            .await;

        let client = PriceOracleClient::new(
            mock_server.uri(),
            Some("oracle-key".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();

        assert!(client.health_check().await);
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/price"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let result = client.prices(&[SOL.to_string()]).await;

        assert!(matches!(result, Err(PriceOracleError::RateLimit)));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_server_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/price"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/price"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { SOL: { "id": SOL, "price": "150" } }
            })))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let prices = client
            .prices_with_retry(&[SOL.to_string()], Some(2))
            .await
            .unwrap();

        assert!((prices[SOL] - 150.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_retry_stops_on_unauthorized() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/price"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let result = client.prices_with_retry(&[SOL.to_string()], Some(3)).await;

        assert!(matches!(result, Err(PriceOracleError::Unauthorized)));
    }

    #[test]
    fn test_price_value_parsing() {
        assert_eq!(PriceValue::Text("2.5".into()).to_usd(), Some(2.5));
        assert_eq!(PriceValue::Number(0.0).to_usd(), None);
        assert_eq!(PriceValue::Text("-1".into()).to_usd(), None);
        assert_eq!(PriceValue::Text("abc".into()).to_usd(), None);
    }
}
