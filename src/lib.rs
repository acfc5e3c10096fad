pub mod config;

pub mod shared {
    pub mod core {
        pub mod backoff;
    }
    pub mod infrastructure {
        pub mod broker;
    }
}

pub mod modules {
    pub mod outcome_publisher {
        pub mod core {
            pub mod handle;
            pub mod status;
            pub mod transaction_id;
        }
        pub mod adapters {
            pub mod outbound {
                pub mod producer_factory;
                pub mod producer_pool;
            }
        }
        pub mod use_cases {
            pub mod publish_outcome {
                pub mod handler;
                pub mod port;
            }
        }
    }

    pub mod saga_steps {
        pub mod core {
            pub mod outcome;
        }
        pub mod use_cases {
            pub mod report_step_outcome {
                pub mod handler;
                pub mod inbound {
                    pub mod http;
                }
            }
        }
    }
}

pub mod shell;
