mod cross_instance;
mod http_surface;
mod matchmaking;
mod relay_flow;
