//! Architectural baseline register metadata
//!
//! Register families that are architecturally guaranteed on every supported
//! processor, embedded so the agent runs without an external metadata file.
//! Model-specific families load on top of this set from a user-supplied
//! document and are probed before use.

pub const BASELINE_MSR_JSON: &str = r#"{
    "msrs": {
        "TIME_STAMP_COUNTER": {
            "offset": "0x10",
            "domain": "cpu",
            "fields": {
                "TIMESTAMP_COUNT": {
                    "begin_bit": 0, "end_bit": 47,
                    "function": "overflow", "units": "none",
                    "scalar": 1.0, "writeable": false,
                    "aggregation": "expect_same",
                    "behavior": "monotone",
                    "description": "Invariant cycle counter incrementing at the base frequency."
                }
            }
        },
        "MPERF": {
            "offset": "0xE7",
            "domain": "cpu",
            "fields": {
                "MCNT": {
                    "begin_bit": 0, "end_bit": 47,
                    "function": "overflow", "units": "none",
                    "scalar": 1.0, "writeable": false,
                    "aggregation": "average",
                    "behavior": "monotone",
                    "description": "Cycle counter at a fixed rate while unhalted."
                }
            }
        },
        "APERF": {
            "offset": "0xE8",
            "domain": "cpu",
            "fields": {
                "ACNT": {
                    "begin_bit": 0, "end_bit": 47,
                    "function": "overflow", "units": "none",
                    "scalar": 1.0, "writeable": false,
                    "aggregation": "average",
                    "behavior": "monotone",
                    "description": "Cycle counter at the actual rate while unhalted."
                }
            }
        },
        "PERF_STATUS": {
            "offset": "0x198",
            "domain": "cpu",
            "fields": {
                "FREQ": {
                    "begin_bit": 8, "end_bit": 15,
                    "function": "scale", "units": "ratio",
                    "scalar": 1.0, "writeable": false,
                    "aggregation": "average",
                    "behavior": "variable",
                    "description": "Operating frequency as a multiple of 100 MHz."
                }
            }
        },
        "PERF_CTL": {
            "offset": "0x199",
            "domain": "cpu",
            "fields": {
                "FREQ": {
                    "begin_bit": 8, "end_bit": 15,
                    "function": "scale", "units": "hertz",
                    "scalar": 1e8, "writeable": true,
                    "aggregation": "average",
                    "behavior": "variable",
                    "description": "Target frequency cap."
                }
            }
        },
        "THERM_STATUS": {
            "offset": "0x19C",
            "domain": "cpu",
            "fields": {
                "DIGITAL_READOUT": {
                    "begin_bit": 16, "end_bit": 22,
                    "function": "scale", "units": "celsius",
                    "scalar": 1.0, "writeable": false,
                    "aggregation": "average",
                    "behavior": "variable",
                    "description": "Margin below the prochot temperature."
                }
            }
        },
        "TEMPERATURE_TARGET": {
            "offset": "0x1A2",
            "domain": "core",
            "fields": {
                "PROCHOT_MIN": {
                    "begin_bit": 16, "end_bit": 23,
                    "function": "scale", "units": "celsius",
                    "scalar": 1.0, "writeable": false,
                    "aggregation": "expect_same",
                    "behavior": "constant",
                    "description": "Temperature at which the thermal control circuit activates."
                }
            }
        },
        "RAPL_POWER_UNIT": {
            "offset": "0x606",
            "domain": "package",
            "fields": {
                "POWER": {
                    "begin_bit": 0, "end_bit": 3,
                    "function": "log_half", "units": "watts",
                    "scalar": 1.0, "writeable": false,
                    "aggregation": "expect_same",
                    "behavior": "constant",
                    "description": "Granularity of RAPL power fields."
                },
                "ENERGY": {
                    "begin_bit": 8, "end_bit": 12,
                    "function": "log_half", "units": "joules",
                    "scalar": 1.0, "writeable": false,
                    "aggregation": "expect_same",
                    "behavior": "constant",
                    "description": "Granularity of RAPL energy fields."
                },
                "TIME": {
                    "begin_bit": 16, "end_bit": 19,
                    "function": "log_half", "units": "seconds",
                    "scalar": 1.0, "writeable": false,
                    "aggregation": "expect_same",
                    "behavior": "constant",
                    "description": "Granularity of RAPL time fields."
                }
            }
        },
        "PKG_POWER_LIMIT": {
            "offset": "0x610",
            "domain": "package",
            "fields": {
                "PL1_POWER_LIMIT": {
                    "begin_bit": 0, "end_bit": 14,
                    "function": "scale", "units": "watts",
                    "scalar": 0.125, "writeable": true,
                    "aggregation": "sum",
                    "behavior": "variable",
                    "description": "Sustained package power limit."
                },
                "PL1_LIMIT_ENABLE": {
                    "begin_bit": 15, "end_bit": 15,
                    "function": "scale", "units": "none",
                    "scalar": 1.0, "writeable": true,
                    "aggregation": "expect_same",
                    "behavior": "variable",
                    "description": "Enable bit for the sustained limit."
                },
                "PL1_CLAMP_ENABLE": {
                    "begin_bit": 16, "end_bit": 16,
                    "function": "scale", "units": "none",
                    "scalar": 1.0, "writeable": true,
                    "aggregation": "expect_same",
                    "behavior": "variable",
                    "description": "Allow the limit to override requested performance."
                },
                "PL1_TIME_WINDOW": {
                    "begin_bit": 17, "end_bit": 23,
                    "function": "7_bit_float", "units": "seconds",
                    "scalar": 0.0009765625, "writeable": true,
                    "aggregation": "expect_same",
                    "behavior": "variable",
                    "description": "Averaging window of the sustained limit."
                },
                "LOCK": {
                    "begin_bit": 63, "end_bit": 63,
                    "function": "scale", "units": "none",
                    "scalar": 1.0, "writeable": false,
                    "aggregation": "expect_same",
                    "behavior": "constant",
                    "description": "Firmware lock; when set the register is immutable until reset."
                }
            }
        },
        "PKG_ENERGY_STATUS": {
            "offset": "0x611",
            "domain": "package",
            "fields": {
                "ENERGY": {
                    "begin_bit": 0, "end_bit": 31,
                    "function": "overflow", "units": "joules",
                    "scalar": 6.103515625e-05, "writeable": false,
                    "aggregation": "sum",
                    "behavior": "monotone",
                    "description": "Accumulated package energy consumption."
                }
            }
        },
        "PKG_POWER_INFO": {
            "offset": "0x614",
            "domain": "package",
            "fields": {
                "THERMAL_SPEC_POWER": {
                    "begin_bit": 0, "end_bit": 14,
                    "function": "scale", "units": "watts",
                    "scalar": 0.125, "writeable": false,
                    "aggregation": "sum",
                    "behavior": "constant",
                    "description": "Thermal design power of the package."
                },
                "MIN_POWER": {
                    "begin_bit": 16, "end_bit": 30,
                    "function": "scale", "units": "watts",
                    "scalar": 0.125, "writeable": false,
                    "aggregation": "sum",
                    "behavior": "constant",
                    "description": "Lowest settable sustained power limit."
                },
                "MAX_POWER": {
                    "begin_bit": 32, "end_bit": 46,
                    "function": "scale", "units": "watts",
                    "scalar": 0.125, "writeable": false,
                    "aggregation": "sum",
                    "behavior": "constant",
                    "description": "Highest settable sustained power limit."
                }
            }
        }
    }
}"#;
