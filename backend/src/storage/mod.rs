pub mod local_service;
