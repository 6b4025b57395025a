// API tests drive the router in-process; HTTP client tests use wiremock servers

mod api_drift;
