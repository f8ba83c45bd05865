//! Integration tests. They expect an out-of-the-box RabbitMq broker
//! listening on localhost (e.g. the official Docker image).
mod publishers;
